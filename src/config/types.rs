use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nsq: NsqConfig,
    #[serde(default)]
    pub bigquery: BigQueryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NsqConfig {
    pub topic: String,
    pub channel: String,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub max_in_flight: usize,
    /// Deliveries after which a row the warehouse keeps refusing is given
    /// up on (acked and reported). 0 disables the ceiling.
    pub max_attempts: u16,
    #[serde(with = "humantime_serde")]
    pub requeue_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_requeue_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub lookupd_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub msg_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            channel: String::new(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            max_in_flight: 200,
            max_attempts: 0,
            requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            lookupd_poll_interval: Duration::from_secs(60),
            msg_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BigQueryConfig {
    pub project: String,
    pub dataset: String,
    pub table: String,
    pub credentials_file: PathBuf,
    pub skip_invalid_rows: bool,
    pub ignore_unknown_values: bool,
    /// Send the NSQ message ID as `insertId` for best-effort de-duplication.
    pub use_insert_id: bool,
    pub endpoint: String,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            dataset: String::new(),
            table: String::new(),
            credentials_file: PathBuf::new(),
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            use_insert_id: true,
            endpoint: "https://bigquery.googleapis.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_rows: usize,
    pub max_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub time_before_flush: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: 100,
            max_bytes: 9 * 1024 * 1024,
            time_before_flush: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Insert attempts per batch before its messages are requeued.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub topic: Option<String>,
    pub channel: Option<String>,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub max_in_flight: Option<usize>,
    pub max_attempts: Option<u16>,
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub max_rows: Option<usize>,
    pub max_bytes: Option<usize>,
    pub time_before_flush: Option<Duration>,
}

impl Config {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(topic) = overrides.topic {
            self.nsq.topic = topic;
        }
        if let Some(channel) = overrides.channel {
            self.nsq.channel = channel;
        }
        if !overrides.nsqd_tcp_addresses.is_empty() {
            self.nsq.nsqd_tcp_addresses = overrides.nsqd_tcp_addresses;
        }
        if !overrides.lookupd_http_addresses.is_empty() {
            self.nsq.lookupd_http_addresses = overrides.lookupd_http_addresses;
        }
        if let Some(max_in_flight) = overrides.max_in_flight {
            self.nsq.max_in_flight = max_in_flight;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.nsq.max_attempts = max_attempts;
        }
        if let Some(project) = overrides.project {
            self.bigquery.project = project;
        }
        if let Some(dataset) = overrides.dataset {
            self.bigquery.dataset = dataset;
        }
        if let Some(table) = overrides.table {
            self.bigquery.table = table;
        }
        if let Some(path) = overrides.credentials_file {
            self.bigquery.credentials_file = path;
        }
        if let Some(max_rows) = overrides.max_rows {
            self.batch.max_rows = max_rows;
        }
        if let Some(max_bytes) = overrides.max_bytes {
            self.batch.max_bytes = max_bytes;
        }
        if let Some(time_before_flush) = overrides.time_before_flush {
            self.batch.time_before_flush = time_before_flush;
        }
    }
}

use clap::Parser;
use nsq_to_bigquery::config::{load_config, Overrides};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nsq_to_bigquery")]
#[command(version, about = "Consume an NSQ topic/channel and stream JSON messages into a BigQuery table", long_about = None)]
struct Cli {
    /// YAML config file; flags override its values
    #[arg(long, env = "NSQ_TO_BIGQUERY_CONFIG")]
    config: Option<PathBuf>,

    /// NSQ topic
    #[arg(long, env = "NSQ_TO_BIGQUERY_TOPIC")]
    topic: Option<String>,

    /// NSQ channel
    #[arg(long, env = "NSQ_TO_BIGQUERY_CHANNEL")]
    channel: Option<String>,

    /// nsqd TCP address (may be given multiple times)
    #[arg(long = "nsqd-tcp-address", env = "NSQ_TO_BIGQUERY_NSQD_TCP_ADDRESS", value_delimiter = ',')]
    nsqd_tcp_addresses: Vec<String>,

    /// nsqlookupd HTTP address (may be given multiple times)
    #[arg(long = "lookupd-http-address", env = "NSQ_TO_BIGQUERY_LOOKUPD_HTTP_ADDRESS", value_delimiter = ',')]
    lookupd_http_addresses: Vec<String>,

    /// Max number of messages to allow in flight
    #[arg(long, env = "NSQ_TO_BIGQUERY_MAX_IN_FLIGHT")]
    max_in_flight: Option<usize>,

    /// Deliveries after which rows BigQuery keeps refusing are dropped (0 = never)
    #[arg(long, env = "NSQ_TO_BIGQUERY_MAX_ATTEMPTS")]
    max_attempts: Option<u16>,

    /// BigQuery project
    #[arg(long = "app", visible_alias = "project", env = "NSQ_TO_BIGQUERY_APP")]
    project: Option<String>,

    /// BigQuery dataset
    #[arg(long, env = "NSQ_TO_BIGQUERY_DATASET")]
    dataset: Option<String>,

    /// BigQuery table
    #[arg(long, env = "NSQ_TO_BIGQUERY_TABLE")]
    table: Option<String>,

    /// Service account JSON key file
    #[arg(long, env = "NSQ_TO_BIGQUERY_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// Rows per insert request
    #[arg(long, env = "NSQ_TO_BIGQUERY_MAX_ROWS")]
    max_rows: Option<usize>,

    /// Approximate payload bytes per insert request
    #[arg(long, env = "NSQ_TO_BIGQUERY_MAX_BYTES")]
    max_bytes: Option<usize>,

    /// Flush a non-empty batch after this long (e.g. 10s, 500ms)
    #[arg(long, env = "NSQ_TO_BIGQUERY_TIME_BEFORE_FLUSH", value_parser = humantime::parse_duration)]
    time_before_flush: Option<Duration>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            nsqd_tcp_addresses: self.nsqd_tcp_addresses.clone(),
            lookupd_http_addresses: self.lookupd_http_addresses.clone(),
            max_in_flight: self.max_in_flight,
            max_attempts: self.max_attempts,
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: self.table.clone(),
            credentials_file: self.credentials_file.clone(),
            max_rows: self.max_rows,
            max_bytes: self.max_bytes,
            time_before_flush: self.time_before_flush,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nsq_to_bigquery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.clone());

    let config = match load_config(config_path.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = nsq_to_bigquery::cli::run::run(config).await {
        error!(error = %e, "Exiting");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// An explicit `--config` wins; otherwise the first existing default
/// location is used. Without a file every setting comes from flags.
fn resolve_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/nsq_to_bigquery/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/nsq_to_bigquery/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

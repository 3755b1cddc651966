use nsq_to_bigquery::config::{load_config, ConfigError, Overrides};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
nsq:
  topic: events
  channel: bigquery
  lookupd_http_addresses:
    - http://lookupd-1:4161
    - http://lookupd-2:4161
  max_in_flight: 500
  max_attempts: 10
  requeue_delay: 30s
  lookupd_poll_interval: 15s

bigquery:
  project: analytics
  dataset: raw
  table: events
  credentials_file: /etc/nsq_to_bigquery/key.json
  ignore_unknown_values: true

batch:
  max_rows: 400
  time_before_flush: 2s

retry:
  max_attempts: 8
  initial_backoff: 250ms
"#;

#[test]
fn test_full_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, FULL_CONFIG).unwrap();

    let config = load_config(Some(config_path.as_path()), Overrides::default()).expect("config should be valid");

    assert_eq!(config.nsq.topic, "events");
    assert_eq!(config.nsq.lookupd_http_addresses.len(), 2);
    assert!(config.nsq.nsqd_tcp_addresses.is_empty());
    assert_eq!(config.nsq.max_in_flight, 500);
    assert_eq!(config.nsq.max_attempts, 10);
    assert_eq!(config.nsq.requeue_delay, Duration::from_secs(30));
    assert_eq!(config.nsq.lookupd_poll_interval, Duration::from_secs(15));
    assert!(config.bigquery.ignore_unknown_values);
    assert!(config.bigquery.use_insert_id);
    assert_eq!(config.batch.max_rows, 400);
    assert_eq!(config.batch.max_bytes, 9 * 1024 * 1024);
    assert_eq!(config.batch.time_before_flush, Duration::from_secs(2));
    assert_eq!(config.retry.max_attempts, 8);
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
    assert_eq!(config.retry.attempt_timeout, Duration::from_secs(30));
}

#[test]
fn test_flags_alone_are_enough() {
    let overrides = Overrides {
        topic: Some("events".into()),
        channel: Some("bigquery".into()),
        nsqd_tcp_addresses: vec!["127.0.0.1:4150".into()],
        project: Some("analytics".into()),
        dataset: Some("raw".into()),
        table: Some("events".into()),
        credentials_file: Some("key.json".into()),
        time_before_flush: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let config = load_config(None, overrides).unwrap();
    assert_eq!(config.nsq.max_in_flight, 200);
    assert_eq!(config.batch.max_rows, 100);
    assert_eq!(config.batch.time_before_flush, Duration::from_millis(500));
}

#[test]
fn test_flags_override_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, FULL_CONFIG).unwrap();

    let overrides = Overrides {
        table: Some("events_v2".into()),
        max_rows: Some(50),
        ..Default::default()
    };
    let config = load_config(Some(config_path.as_path()), overrides).unwrap();

    assert_eq!(config.bigquery.table, "events_v2");
    assert_eq!(config.batch.max_rows, 50);
    assert_eq!(config.bigquery.dataset, "raw");
}

#[test]
fn test_empty_configuration_lists_required_settings() {
    let err = load_config(None, Overrides::default()).unwrap_err();

    let ConfigError::ValidationList(errors) = err else {
        panic!("expected validation errors, got {err}");
    };
    for expected in [
        "--topic is required",
        "--channel is required",
        "--nsqd-tcp-address or --lookupd-http-address required",
        "--credentials-file is required",
        "--app is required",
        "--dataset is required",
        "--table is required",
    ] {
        assert!(errors.iter().any(|e| e == expected), "missing: {expected}");
    }
}

#[test]
fn test_batch_larger_than_in_flight_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, FULL_CONFIG).unwrap();

    let overrides = Overrides {
        max_in_flight: Some(50),
        ..Default::default()
    };
    let err = load_config(Some(config_path.as_path()), overrides).unwrap_err();

    let ConfigError::ValidationList(errors) = err else {
        panic!("expected validation errors, got {err}");
    };
    assert_eq!(
        errors,
        vec!["max_rows (400) must not exceed max_in_flight (50), or batches can only flush on time_before_flush"]
    );
}

#[test]
fn test_env_vars_in_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    std::env::set_var("NSQ_TO_BIGQUERY_TEST_DATASET", "from_env");
    fs::write(
        &config_path,
        FULL_CONFIG.replace("dataset: raw", "dataset: $env{NSQ_TO_BIGQUERY_TEST_DATASET}"),
    )
    .unwrap();

    let config = load_config(Some(config_path.as_path()), Overrides::default()).unwrap();
    assert_eq!(config.bigquery.dataset, "from_env");
}

#[test]
fn test_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = load_config(Some(temp_dir.path().join("absent.yml").as_path()), Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

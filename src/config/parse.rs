use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Largest row count accepted by a single insertAll request.
pub const MAX_ROWS_PER_REQUEST: usize = 50_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Build the effective configuration: optional YAML file, then command-line
/// overrides, then validation.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => parse_config_file(path)?,
        None => Config::default(),
    };

    config.apply(overrides);
    config.bigquery.credentials_file = expand_tilde(&config.bigquery.credentials_file);

    validate_config(&config)?;
    Ok(config)
}

pub fn parse_config_file(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config_str(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = super::env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        unexpanded_vars.join(", ")
    )))
}

fn nsq_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[.a-zA-Z0-9_-]+(#ephemeral)?$").expect("static regex is valid")
    })
}

fn is_valid_nsq_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 64 && nsq_name_pattern().is_match(name)
}

/// Validate the whole configuration, reporting every problem at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let nsq = &config.nsq;

    if nsq.topic.is_empty() {
        errors.push("--topic is required".to_string());
    } else if !is_valid_nsq_name(&nsq.topic) {
        errors.push(format!("invalid topic name '{}'", nsq.topic));
    }

    if nsq.channel.is_empty() {
        errors.push("--channel is required".to_string());
    } else if !is_valid_nsq_name(&nsq.channel) {
        errors.push(format!("invalid channel name '{}'", nsq.channel));
    }

    match (
        nsq.nsqd_tcp_addresses.is_empty(),
        nsq.lookupd_http_addresses.is_empty(),
    ) {
        (true, true) => {
            errors.push("--nsqd-tcp-address or --lookupd-http-address required".to_string())
        }
        (false, false) => errors
            .push("use --nsqd-tcp-address or --lookupd-http-address not both".to_string()),
        _ => {}
    }

    if nsq.max_in_flight == 0 {
        errors.push("max_in_flight must be at least 1".to_string());
    }

    let bq = &config.bigquery;
    if bq.credentials_file.as_os_str().is_empty() {
        errors.push("--credentials-file is required".to_string());
    }
    if bq.project.is_empty() {
        errors.push("--app is required".to_string());
    }
    if bq.dataset.is_empty() {
        errors.push("--dataset is required".to_string());
    }
    if bq.table.is_empty() {
        errors.push("--table is required".to_string());
    }

    let batch = &config.batch;
    if batch.max_rows == 0 || batch.max_rows > MAX_ROWS_PER_REQUEST {
        errors.push(format!(
            "max_rows must be between 1 and {}, got {}",
            MAX_ROWS_PER_REQUEST, batch.max_rows
        ));
    }
    if nsq.max_in_flight > 0 && batch.max_rows > nsq.max_in_flight {
        // Buffered rows keep their admission credit until flushed
        errors.push(format!(
            "max_rows ({}) must not exceed max_in_flight ({}), or batches can only flush on time_before_flush",
            batch.max_rows, nsq.max_in_flight
        ));
    }
    if batch.max_bytes == 0 {
        errors.push("max_bytes must be positive".to_string());
    }
    if batch.time_before_flush.is_zero() {
        errors.push("time_before_flush must be positive".to_string());
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }
    if retry.attempt_timeout.is_zero() {
        errors.push("retry.attempt_timeout must be positive".to_string());
    }
    if retry.initial_backoff > retry.max_backoff {
        errors.push("retry.initial_backoff must not exceed retry.max_backoff".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

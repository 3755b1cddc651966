pub mod cli;
pub mod config;
pub mod pipeline;
pub mod queue;
pub mod warehouse;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sent to nsqd in IDENTIFY and as the HTTP user agent.
pub const USER_AGENT: &str = concat!("nsq_to_bigquery/", env!("CARGO_PKG_VERSION"));

//! nsqlookupd discovery over HTTP.

use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup request to {address} failed: {source}")]
    Request {
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{address} returned HTTP {status}")]
    Status { address: String, status: StatusCode },
}

#[derive(Debug, Deserialize)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
}

impl Producer {
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}

/// Accepts both the current response shape and the legacy one that wraps
/// the payload in `data`.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Option<Vec<Producer>>,
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

impl LookupResponse {
    fn into_producers(self) -> Vec<Producer> {
        match (self.producers, self.data) {
            (Some(producers), _) => producers,
            (None, Some(data)) => data.producers,
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupClient {
    client: reqwest::Client,
}

impl LookupClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// TCP addresses of every nsqd producing `topic`, as seen by one
    /// nsqlookupd. An unknown topic yields an empty list.
    pub async fn producers(&self, address: &str, topic: &str) -> Result<Vec<String>, LookupError> {
        let url = lookup_url(address);
        let response = self
            .client
            .get(&url)
            .query(&[("topic", topic)])
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await
            .map_err(|source| LookupError::Request {
                address: address.to_string(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(LookupError::Status {
                address: address.to_string(),
                status,
            });
        }

        let body: LookupResponse = response.json().await.map_err(|source| LookupError::Request {
            address: address.to_string(),
            source,
        })?;

        Ok(body
            .into_producers()
            .iter()
            .map(Producer::tcp_address)
            .collect())
    }
}

fn lookup_url(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}/lookup", base)
    } else {
        format!("http://{}/lookup", base)
    }
}

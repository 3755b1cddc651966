pub mod auth;
pub mod bigquery;

use crate::pipeline::decoder::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use auth::{ServiceAccountTokens, StaticToken, TokenProvider};
pub use bigquery::BigQueryClient;

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// One row of an insert request.
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    #[serde(rename = "insertId", skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
    pub json: Record,
}

/// Detail of why the warehouse refused a row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Errors reported for a single row, by position in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub index: usize,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

/// Result of an insert call the warehouse accepted at the request level.
/// Rows not listed in `row_errors` were inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResponse {
    pub row_errors: Vec<RowError>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    /// Network failure, 5xx, throttling. Worth retrying.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential rejected or could not be minted.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Destination does not exist or is otherwise unusable; no later request
    /// can succeed either.
    #[error("destination unavailable (status {status}): {message}")]
    Destination { status: u16, message: String },

    /// The request itself was malformed; resending it will not help.
    #[error("request rejected (status {status}): {message}")]
    Invalid { status: u16, message: String },
}

impl WarehouseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::Transport(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WarehouseError::Auth(_) | WarehouseError::Destination { .. }
        )
    }
}

/// A tabular sink that accepts batched inserts.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn insert(&self, table: &TableRef, rows: &[Row]) -> Result<InsertResponse, WarehouseError>;
}

/// Per-row rejection reasons that redelivery cannot fix.
const PERMANENT_REASONS: &[&str] = &["invalid"];

/// A row is permanently rejected if any of its errors carries a reason that
/// redelivery cannot fix. Anything else (e.g. `stopped`, `timeout`,
/// `backendError`) may succeed on a later attempt.
pub fn is_permanent(errors: &[ErrorDetail]) -> bool {
    errors.iter().any(|e| {
        e.reason
            .as_deref()
            .map(|r| PERMANENT_REASONS.contains(&r))
            .unwrap_or(false)
    })
}

/// Human-readable summary of a row's errors for log lines.
pub fn describe(errors: &[ErrorDetail]) -> String {
    if errors.is_empty() {
        return "unspecified".to_string();
    }
    errors
        .iter()
        .map(|e| {
            let reason = e.reason.as_deref().unwrap_or("unknown");
            match (&e.location, &e.message) {
                (Some(loc), Some(msg)) => format!("{} at {}: {}", reason, loc, msg),
                (None, Some(msg)) => format!("{}: {}", reason, msg),
                _ => reason.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

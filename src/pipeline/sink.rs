use crate::pipeline::batch::Batch;
use crate::pipeline::decoder::preview;
use crate::pipeline::stats::PipelineStats;
use crate::queue::Message;
use crate::warehouse::{
    describe, is_permanent, ErrorDetail, InsertResponse, Row, RowError, TableRef, Warehouse,
    WarehouseError,
};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ROW_PREVIEW_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub table: TableRef,
    pub use_insert_id: bool,
    /// Insert attempts per batch before its messages are requeued
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single insert call; exceeding it counts as a transport error
    pub attempt_timeout: Duration,
    pub requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    /// Delivery count at which a row the warehouse keeps refusing is given
    /// up on. 0 disables the ceiling.
    pub max_deliveries: u16,
}

/// Lifecycle of one batch inside the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Assembled,
    Submitting,
    Retrying,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

/// Per-row result, aligned with the batch's row order.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Accepted,
    Rejected { reason: String, permanent: bool },
}

#[derive(Debug, Clone)]
pub struct FlushReport {
    pub batch_id: Uuid,
    pub rows: usize,
    pub attempts: u32,
    pub state: FlushState,
    pub outcomes: Vec<RowOutcome>,
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
    pub given_up: usize,
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// No later batch can succeed either; the batch's messages were requeued.
    #[error("fatal warehouse error on batch {batch_id} after {attempts} attempt(s): {source}")]
    Fatal {
        batch_id: Uuid,
        attempts: u32,
        #[source]
        source: WarehouseError,
    },
}

/// Submits closed batches to the warehouse and resolves every message in them.
pub struct SinkWriter {
    warehouse: Arc<dyn Warehouse>,
    settings: SinkSettings,
    stats: Arc<PipelineStats>,
}

impl SinkWriter {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        settings: SinkSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            warehouse,
            settings,
            stats,
        }
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    /// Flush one batch with one insert request, retrying transport failures.
    ///
    /// On return every message in the batch has been acked or requeued.
    pub async fn flush(&self, batch: Batch) -> Result<FlushReport, SinkError> {
        let batch_id = batch.id;
        let (rows, messages): (Vec<Row>, Vec<Message>) = batch
            .rows
            .into_iter()
            .map(|pending| {
                let insert_id = self
                    .settings
                    .use_insert_id
                    .then(|| pending.message.id().to_string());
                let row = Row {
                    insert_id,
                    json: pending.record,
                };
                (row, pending.message)
            })
            .unzip();

        let mut state = FlushState::Assembled;
        debug!(batch_id = %batch_id, rows = rows.len(), state = ?state, "Batch assembled");

        let (mut attempts, mut result) = self.submit(batch_id, &rows, &mut state).await;

        if let Err(WarehouseError::Invalid { status, message }) = &result {
            warn!(
                batch_id = %batch_id,
                table = %self.settings.table,
                status = *status,
                rows = rows.len(),
                error = %message,
                "Warehouse rejected the whole request, isolating rejected rows"
            );
            let rejection = message.clone();
            result = self
                .isolate_rejection(batch_id, &rows, &mut state, &mut attempts, rejection)
                .await;
        }

        match result {
            Ok(response) => Ok(self.settle(batch_id, attempts, &rows, messages, response)),
            Err(e) if e.is_transient() => {
                error!(
                    batch_id = %batch_id,
                    table = %self.settings.table,
                    attempts = attempts,
                    rows = rows.len(),
                    error = %e,
                    "Insert retries exhausted, requeueing batch"
                );
                let outcomes = vec![
                    RowOutcome::Rejected {
                        reason: e.to_string(),
                        permanent: false,
                    };
                    rows.len()
                ];
                let requeued = self.requeue_all(messages);
                self.stats.record_batch(true);
                Ok(FlushReport {
                    batch_id,
                    rows: rows.len(),
                    attempts,
                    state: FlushState::Failed,
                    outcomes,
                    acked: 0,
                    requeued,
                    rejected: 0,
                    given_up: 0,
                })
            }
            Err(source) => {
                error!(
                    batch_id = %batch_id,
                    table = %self.settings.table,
                    error = %source,
                    "Fatal warehouse error, requeueing batch"
                );
                self.requeue_all(messages);
                self.stats.record_batch(true);
                Err(SinkError::Fatal {
                    batch_id,
                    attempts,
                    source,
                })
            }
        }
    }

    /// One insert request with transport retries. Returns the attempts used.
    async fn submit(
        &self,
        batch_id: Uuid,
        rows: &[Row],
        state: &mut FlushState,
    ) -> (u32, Result<InsertResponse, WarehouseError>) {
        let mut attempts = 0;
        let mut backoff = self.settings.initial_backoff;
        loop {
            attempts += 1;
            if *state == FlushState::Assembled {
                *state = FlushState::Submitting;
            }
            debug!(batch_id = %batch_id, attempt = attempts, rows = rows.len(), state = ?state, "Submitting batch");

            let outcome = match tokio::time::timeout(
                self.settings.attempt_timeout,
                self.warehouse.insert(&self.settings.table, rows),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(WarehouseError::Transport(format!(
                    "insert timed out after {:?}",
                    self.settings.attempt_timeout
                ))),
            };

            match outcome {
                Err(e) if e.is_transient() && attempts < self.settings.max_attempts => {
                    *state = FlushState::Retrying;
                    warn!(
                        batch_id = %batch_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Insert failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.settings.max_backoff);
                }
                other => return (attempts, other),
            }
        }
    }

    /// Resubmit a rejected request in halves until every rejected piece is a
    /// single row. Only rows rejected on their own are reported as invalid,
    /// so an oversized request or one bad row cannot drop the rest.
    ///
    /// A transport or fatal error part way through fails the whole batch;
    /// rows already inserted are redelivered and de-duplicated by `insertId`.
    async fn isolate_rejection(
        &self,
        batch_id: Uuid,
        rows: &[Row],
        state: &mut FlushState,
        attempts: &mut u32,
        rejection: String,
    ) -> Result<InsertResponse, WarehouseError> {
        let mut row_errors = Vec::new();
        // A range paired with Some(message) is already known to be rejected
        let mut pending: Vec<(Range<usize>, Option<String>)> = vec![(0..rows.len(), Some(rejection))];

        while let Some((range, rejected)) = pending.pop() {
            let rejected = match rejected {
                Some(message) => message,
                None => {
                    let (used, result) = self.submit(batch_id, &rows[range.clone()], state).await;
                    *attempts += used;
                    match result {
                        Ok(response) => {
                            row_errors.extend(offset(batch_id, response, &range));
                            continue;
                        }
                        Err(WarehouseError::Invalid { message, .. }) => message,
                        Err(e) => return Err(e),
                    }
                }
            };

            if range.len() > 1 {
                let mid = range.start + range.len() / 2;
                pending.push((mid..range.end, None));
                pending.push((range.start..mid, None));
            } else {
                row_errors.push(RowError {
                    index: range.start,
                    errors: vec![ErrorDetail {
                        reason: Some("invalid".to_string()),
                        location: None,
                        message: Some(rejected),
                    }],
                });
            }
        }

        row_errors.sort_by_key(|e| e.index);
        Ok(InsertResponse { row_errors })
    }

    /// Apply the per-row response: ack accepted and permanently rejected rows,
    /// requeue the rest.
    fn settle(
        &self,
        batch_id: Uuid,
        attempts: u32,
        rows: &[Row],
        messages: Vec<Message>,
        response: InsertResponse,
    ) -> FlushReport {
        let mut outcomes = vec![RowOutcome::Accepted; rows.len()];
        for RowError { index, errors } in response.row_errors {
            match outcomes.get_mut(index) {
                Some(slot) => {
                    *slot = RowOutcome::Rejected {
                        reason: describe(&errors),
                        permanent: is_permanent(&errors),
                    }
                }
                None => warn!(
                    batch_id = %batch_id,
                    index = index,
                    rows = rows.len(),
                    "Row error index out of range, ignoring"
                ),
            }
        }

        let mut report = FlushReport {
            batch_id,
            rows: rows.len(),
            attempts,
            state: FlushState::Succeeded,
            outcomes: Vec::new(),
            acked: 0,
            requeued: 0,
            rejected: 0,
            given_up: 0,
        };

        for ((message, row), outcome) in messages.into_iter().zip(rows).zip(&outcomes) {
            match outcome {
                RowOutcome::Accepted => {
                    message.ack();
                    report.acked += 1;
                }
                RowOutcome::Rejected {
                    reason,
                    permanent: true,
                } => {
                    error!(
                        table = %self.settings.table,
                        message_id = %message.id(),
                        row = %row_preview(row),
                        reason = %reason,
                        "Row permanently rejected, dropping"
                    );
                    message.ack();
                    report.acked += 1;
                    report.rejected += 1;
                }
                RowOutcome::Rejected { reason, .. } if self.exhausted(&message) => {
                    error!(
                        table = %self.settings.table,
                        message_id = %message.id(),
                        attempts = message.attempts(),
                        row = %row_preview(row),
                        reason = %reason,
                        "Row rejected too many times, giving up"
                    );
                    message.ack();
                    report.acked += 1;
                    report.given_up += 1;
                }
                RowOutcome::Rejected { reason, .. } => {
                    debug!(
                        message_id = %message.id(),
                        reason = %reason,
                        "Row rejected transiently, requeueing"
                    );
                    let delay = self.requeue_delay(message.attempts());
                    message.requeue(delay);
                    report.requeued += 1;
                }
            }
        }

        if report.acked - report.rejected - report.given_up < report.rows {
            report.state = FlushState::PartiallySucceeded;
        }
        report.outcomes = outcomes;

        self.stats.record_acked(report.acked as u64);
        self.stats.record_requeued(report.requeued as u64);
        self.stats.record_rejected(report.rejected as u64);
        self.stats.record_given_up(report.given_up as u64);
        self.stats.record_batch(false);

        match report.state {
            FlushState::Succeeded => info!(
                batch_id = %batch_id,
                table = %self.settings.table,
                rows = report.rows,
                attempts = attempts,
                "Batch inserted"
            ),
            _ => warn!(
                batch_id = %batch_id,
                table = %self.settings.table,
                rows = report.rows,
                acked = report.acked,
                requeued = report.requeued,
                rejected = report.rejected,
                given_up = report.given_up,
                "Batch partially inserted"
            ),
        }

        report
    }

    fn exhausted(&self, message: &Message) -> bool {
        self.settings.max_deliveries > 0 && message.attempts() >= self.settings.max_deliveries
    }

    fn requeue_delay(&self, attempts: u16) -> Duration {
        self.settings
            .requeue_delay
            .saturating_mul(attempts.max(1) as u32)
            .min(self.settings.max_requeue_delay)
    }

    fn requeue_all(&self, messages: Vec<Message>) -> usize {
        let count = messages.len();
        for message in messages {
            let delay = self.requeue_delay(message.attempts());
            message.requeue(delay);
        }
        self.stats.record_requeued(count as u64);
        count
    }
}

/// Shift row errors of a sub-request back to batch positions.
fn offset(batch_id: Uuid, response: InsertResponse, range: &Range<usize>) -> Vec<RowError> {
    let mut shifted = Vec::with_capacity(response.row_errors.len());
    for mut row_error in response.row_errors {
        if row_error.index >= range.len() {
            warn!(batch_id = %batch_id, index = row_error.index, rows = range.len(), "Row error index out of range, ignoring");
            continue;
        }
        row_error.index += range.start;
        shifted.push(row_error);
    }
    shifted
}

fn row_preview(row: &Row) -> String {
    let json = serde_json::to_string(&row.json).unwrap_or_default();
    preview(json.as_bytes(), ROW_PREVIEW_LIMIT)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Warehouse that replays scripted responses; once the script is used up
    /// every row is accepted.
    #[derive(Default)]
    pub struct ScriptedWarehouse {
        script: Mutex<VecDeque<Result<InsertResponse, WarehouseError>>>,
        calls: Mutex<Vec<usize>>,
        delay: Option<Duration>,
    }

    impl ScriptedWarehouse {
        pub fn new(script: Vec<Result<InsertResponse, WarehouseError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        pub fn accepting() -> Self {
            Self::default()
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Row count of every insert call, in call order.
        pub fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        async fn insert(
            &self,
            _table: &TableRef,
            rows: &[Row],
        ) -> Result<InsertResponse, WarehouseError> {
            self.calls.lock().unwrap().push(rows.len());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(InsertResponse::default()))
        }
    }

    pub fn settings() -> SinkSettings {
        SinkSettings {
            table: TableRef {
                project: "proj".into(),
                dataset: "ds".into(),
                table: "tbl".into(),
            },
            use_insert_id: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
            requeue_delay: Duration::from_secs(1),
            max_requeue_delay: Duration::from_secs(10),
            max_deliveries: 0,
        }
    }

    pub fn row_error(index: usize, reason: &str) -> RowError {
        RowError {
            index,
            errors: vec![ErrorDetail {
                reason: Some(reason.to_string()),
                location: None,
                message: Some(format!("{} row", reason)),
            }],
        }
    }
}

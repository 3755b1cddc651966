use crate::pipeline::batch::{AddOutcome, Batch, BatchAccumulator};
use crate::pipeline::decoder::{decode, preview};
use crate::pipeline::flow::FlowController;
use crate::pipeline::sink::{FlushReport, SinkError, SinkWriter};
use crate::pipeline::stats::{PipelineStats, StatsSnapshot};
use crate::queue::Message;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BODY_PREVIEW_LIMIT: usize = 256;
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("pipeline aborted: {0}")]
    Fatal(#[from] SinkError),
}

/// Final accounting returned after a drained shutdown.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub stats: StatsSnapshot,
    /// Row counts of every batch handed to the writer, in hand-off order
    pub flushed_batches: Vec<usize>,
}

/// Owns the pipeline lifecycle: admission, decoding, batching, supervised
/// flushes and the drain on shutdown.
pub struct Supervisor {
    flow: FlowController,
    accumulator: Arc<BatchAccumulator>,
    writer: Arc<SinkWriter>,
    stats: Arc<PipelineStats>,
    tick: Duration,
}

/// State of the message loop, shared by the steady-state loop and the drain.
struct Tasks {
    handlers: JoinSet<()>,
    flushes: JoinSet<Result<FlushReport, SinkError>>,
    flush_tx: mpsc::UnboundedSender<Batch>,
    flush_rx: mpsc::UnboundedReceiver<Batch>,
    flushed_batches: Vec<usize>,
    fatal: Option<SinkError>,
}

impl Supervisor {
    pub fn new(
        flow: FlowController,
        accumulator: Arc<BatchAccumulator>,
        writer: Arc<SinkWriter>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let tick = std::cmp::max(accumulator.limits().time_before_flush / 4, MIN_TICK);
        Self {
            flow,
            accumulator,
            writer,
            stats,
            tick,
        }
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Run until `shutdown` fires, a fatal sink error occurs, or the message
    /// stream ends; then drain and return.
    ///
    /// Every message received from `messages` is acked or requeued before
    /// this returns.
    pub async fn run(
        self,
        mut messages: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) -> Result<PipelineSummary, SupervisorError> {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks {
            handlers: JoinSet::new(),
            flushes: JoinSet::new(),
            flush_tx,
            flush_rx,
            flushed_batches: Vec::new(),
            fatal: None,
        };

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            max_in_flight = self.flow.capacity(),
            max_rows = self.accumulator.limits().max_rows,
            time_before_flush_ms = self.accumulator.limits().time_before_flush.as_millis() as u64,
            "Pipeline started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, draining pipeline");
                    break;
                }

                received = messages.recv() => match received {
                    Some(message) => self.spawn_handler(&mut tasks, message),
                    None => {
                        warn!("Message stream closed, draining pipeline");
                        break;
                    }
                },

                Some(batch) = tasks.flush_rx.recv() => {
                    self.spawn_flush(&mut tasks, batch);
                }

                _ = ticker.tick() => {
                    if let Some(batch) = self.accumulator.check_timeout() {
                        debug!(batch_id = %batch.id, rows = batch.len(), "Batch overdue, flushing");
                        self.spawn_flush(&mut tasks, batch);
                    }
                }

                Some(joined) = tasks.flushes.join_next() => {
                    if self.observe_flush(&mut tasks, joined) {
                        error!("Fatal sink error, stopping admission and draining");
                        break;
                    }
                }

                Some(joined) = tasks.handlers.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Message handler task failed");
                    }
                }
            }
        }

        shutdown.cancel();
        self.drain(&mut tasks, &mut messages).await;

        let summary = PipelineSummary {
            stats: self.stats.snapshot(),
            flushed_batches: tasks.flushed_batches,
        };

        match tasks.fatal {
            Some(e) => Err(SupervisorError::Fatal(e)),
            None => Ok(summary),
        }
    }

    /// Stop admission, resolve everything already admitted, force-flush the
    /// open batch and wait for every flush in flight.
    async fn drain(&self, tasks: &mut Tasks, messages: &mut mpsc::Receiver<Message>) {
        self.flow.close();

        // Messages admitted before the gate closed are still owed a resolution
        while let Some(message) = messages.recv().await {
            self.spawn_handler(tasks, message);
        }

        while let Some(joined) = tasks.handlers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message handler task failed");
            }
        }

        while let Ok(batch) = tasks.flush_rx.try_recv() {
            self.spawn_flush(tasks, batch);
        }

        if let Some(batch) = self.accumulator.drain() {
            info!(batch_id = %batch.id, rows = batch.len(), "Flushing partial batch on shutdown");
            self.spawn_flush(tasks, batch);
        }

        while let Some(joined) = tasks.flushes.join_next().await {
            self.observe_flush(tasks, joined);
        }

        let stats = self.stats.snapshot();
        info!(
            admitted = stats.admitted,
            acked = stats.acked,
            requeued = stats.requeued,
            decode_failures = stats.decode_failures,
            rows_rejected = stats.rows_rejected,
            given_up = stats.given_up,
            batches_flushed = stats.batches_flushed,
            batches_failed = stats.batches_failed,
            "Pipeline drained"
        );
    }

    fn spawn_handler(&self, tasks: &mut Tasks, message: Message) {
        self.stats.record_admitted();
        let accumulator = Arc::clone(&self.accumulator);
        let stats = Arc::clone(&self.stats);
        let flush_tx = tasks.flush_tx.clone();

        tasks.handlers.spawn(async move {
            handle_message(message, &accumulator, &stats, &flush_tx);
        });
    }

    fn spawn_flush(&self, tasks: &mut Tasks, batch: Batch) {
        tasks.flushed_batches.push(batch.len());
        let writer = Arc::clone(&self.writer);
        tasks.flushes.spawn(async move { writer.flush(batch).await });
    }

    /// Record a finished flush. Returns true if it was fatal.
    fn observe_flush(
        &self,
        tasks: &mut Tasks,
        joined: Result<Result<FlushReport, SinkError>, tokio::task::JoinError>,
    ) -> bool {
        match joined {
            Ok(Ok(report)) => {
                debug!(
                    batch_id = %report.batch_id,
                    state = ?report.state,
                    acked = report.acked,
                    requeued = report.requeued,
                    "Flush finished"
                );
                false
            }
            Ok(Err(e)) => {
                error!(error = %e, "Flush failed fatally");
                if tasks.fatal.is_none() {
                    tasks.fatal = Some(e);
                }
                true
            }
            Err(e) => {
                // The batch's messages were dropped with the task and requeue
                // themselves.
                error!(error = %e, "Flush task panicked");
                false
            }
        }
    }
}

/// Decode one message and add it to the open batch. Undecodable messages are
/// reported and acked so they cannot block the stream.
fn handle_message(
    message: Message,
    accumulator: &BatchAccumulator,
    stats: &PipelineStats,
    flush_tx: &mpsc::UnboundedSender<Batch>,
) {
    let record = match decode(message.body()) {
        Ok(record) => record,
        Err(e) => {
            error!(
                message_id = %message.id(),
                attempts = message.attempts(),
                body = %preview(message.body(), BODY_PREVIEW_LIMIT),
                error = %e,
                "Dropping undecodable message"
            );
            stats.record_decode_failure();
            stats.record_acked(1);
            message.ack();
            return;
        }
    };

    if let AddOutcome::Full(batch) = accumulator.add(record, message) {
        debug!(batch_id = %batch.id, rows = batch.len(), "Batch full, flushing");
        // The supervisor holds the receiver until every handler has finished
        if let Err(mpsc::error::SendError(batch)) = flush_tx.send(batch) {
            error!(batch_id = %batch.id, "Flush queue closed, requeueing batch");
            for row in batch.rows {
                row.message.requeue(Duration::ZERO);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch::BatchLimits;
    use crate::pipeline::sink::testing::{settings, ScriptedWarehouse};
    use crate::queue::testing::RecordingResponder;
    use crate::warehouse::WarehouseError;

    fn supervisor(
        capacity: usize,
        limits: BatchLimits,
        warehouse: Arc<ScriptedWarehouse>,
    ) -> Supervisor {
        let stats = Arc::new(PipelineStats::new());
        let writer = Arc::new(SinkWriter::new(warehouse, settings(), stats.clone()));
        Supervisor::new(
            FlowController::new(capacity),
            Arc::new(BatchAccumulator::new(limits)),
            writer,
            stats,
        )
    }

    #[tokio::test]
    async fn test_decode_failure_is_acked() {
        let responder = RecordingResponder::new();
        let warehouse = Arc::new(ScriptedWarehouse::accepting());
        let sup = supervisor(
            10,
            BatchLimits {
                max_rows: 10,
                max_bytes: usize::MAX,
                time_before_flush: Duration::from_secs(60),
            },
            warehouse.clone(),
        );
        let flow = sup.flow().clone();

        let (tx, rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        for body in ["not json", r#"{"ok": true}"#] {
            let credit = flow.admit().await.unwrap();
            tx.send(responder.message(body).with_credit(credit)).await.unwrap();
        }
        drop(tx);

        let run = tokio::spawn(sup.run(rx, shutdown.clone()));

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.stats.decode_failures, 1);
        assert_eq!(summary.stats.acked, 2);
        assert_eq!(summary.flushed_batches, vec![1]);
        assert_eq!(warehouse.calls(), vec![1]);
        assert_eq!(responder.finished(), 2);
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fatal_flush_stops_pipeline() {
        let responder = RecordingResponder::new();
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![Err(WarehouseError::Auth(
            "revoked".into(),
        ))]));
        let sup = supervisor(
            10,
            BatchLimits {
                max_rows: 2,
                max_bytes: usize::MAX,
                time_before_flush: Duration::from_secs(60),
            },
            warehouse,
        );
        let flow = sup.flow().clone();

        let (tx, rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        for i in 0..3 {
            let credit = flow.admit().await.unwrap();
            let body = format!(r#"{{"i": {}}}"#, i);
            tx.send(responder.message(&body).with_credit(credit)).await.unwrap();
        }

        // Like a consumer, keep the stream open until shutdown is signalled
        let feeder_shutdown = shutdown.clone();
        tokio::spawn(async move {
            feeder_shutdown.cancelled().await;
            drop(tx);
        });

        let run = tokio::spawn(sup.run(rx, shutdown.clone()));
        let result = run.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::Fatal(_))));
        assert!(shutdown.is_cancelled());
        assert!(flow.is_closed());

        // The failed batch was requeued; the third row was drained and inserted
        assert_eq!(responder.requeued(), 2);
        assert_eq!(responder.finished(), 1);
    }
}

use crate::config::Config;
use crate::pipeline::{
    BatchAccumulator, BatchLimits, FlowController, PipelineStats, PipelineSummary, SinkSettings,
    SinkWriter, Supervisor, SupervisorError,
};
use crate::queue::nsq::{Consumer, ConsumerConfig, ConsumerError};
use crate::warehouse::auth::CredentialsError;
use crate::warehouse::{
    BigQueryClient, ServiceAccountTokens, TableRef, TokenProvider, Warehouse, WarehouseError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("failed to obtain an access token: {0}")]
    Token(#[source] WarehouseError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Pipeline(#[from] SupervisorError),
}

/// Load credentials, connect to NSQ and run until a signal or a fatal
/// warehouse error.
pub async fn run(config: Config) -> Result<PipelineSummary, RunError> {
    let credentials = &config.bigquery.credentials_file;
    info!(path = %credentials.display(), "Loading service account credentials");
    let tokens = ServiceAccountTokens::from_file(credentials).await?;

    // Fail at startup rather than on the first flush
    tokens.token().await.map_err(RunError::Token)?;

    let tokens: Arc<dyn TokenProvider> = Arc::new(tokens);
    let warehouse = Arc::new(BigQueryClient::new(&config.bigquery, tokens)?);

    run_with_warehouse(config, warehouse).await
}

/// Run the pipeline against an already-built warehouse client.
pub async fn run_with_warehouse(
    config: Config,
    warehouse: Arc<dyn Warehouse>,
) -> Result<PipelineSummary, RunError> {
    let stats = Arc::new(PipelineStats::new());
    let flow = FlowController::new(config.nsq.max_in_flight);
    let accumulator = Arc::new(BatchAccumulator::new(BatchLimits {
        max_rows: config.batch.max_rows,
        max_bytes: config.batch.max_bytes,
        time_before_flush: config.batch.time_before_flush,
    }));
    let settings = sink_settings(&config);
    info!(table = %settings.table, "Writing to BigQuery");
    let writer = Arc::new(SinkWriter::new(warehouse, settings, stats.clone()));

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    info!(
        topic = %config.nsq.topic,
        channel = %config.nsq.channel,
        max_in_flight = config.nsq.max_in_flight,
        "Starting consumer"
    );
    let (consumer, messages) =
        match Consumer::start(ConsumerConfig::from(&config.nsq), flow.clone(), shutdown.clone()) {
            Ok(started) => started,
            Err(e) => {
                signals.abort();
                return Err(e.into());
            }
        };

    let supervisor = Supervisor::new(flow, accumulator, writer, stats);
    let result = supervisor.run(messages, shutdown.clone()).await;

    info!("Waiting for NSQ connections to close");
    consumer.wait().await;
    signals.abort();

    let summary = result?;
    info!(
        batches = summary.flushed_batches.len(),
        acked = summary.stats.acked,
        requeued = summary.stats.requeued,
        "Shutdown complete"
    );
    Ok(summary)
}

pub fn sink_settings(config: &Config) -> SinkSettings {
    SinkSettings {
        table: TableRef {
            project: config.bigquery.project.clone(),
            dataset: config.bigquery.dataset.clone(),
            table: config.bigquery.table.clone(),
        },
        use_insert_id: config.bigquery.use_insert_id,
        max_attempts: config.retry.max_attempts,
        initial_backoff: config.retry.initial_backoff,
        max_backoff: config.retry.max_backoff,
        attempt_timeout: config.retry.attempt_timeout,
        requeue_delay: config.nsq.requeue_delay,
        max_requeue_delay: config.nsq.max_requeue_delay,
        max_deliveries: config.nsq.max_attempts,
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Cannot listen for Ctrl+C");
                return;
            }
            info!("Interrupt received, shutting down");
        }
        _ = terminate => info!("Terminate signal received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

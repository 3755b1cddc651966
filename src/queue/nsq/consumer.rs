use super::connection::{self, ConnectionConfig};
use super::lookup::LookupClient;
use super::protocol::{Identify, DEFAULT_MAX_FRAME_SIZE};
use crate::config::NsqConfig;
use crate::pipeline::flow::FlowController;
use crate::queue::Message;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("no nsqd or nsqlookupd addresses configured")]
    NoAddresses,

    #[error("failed to build lookup client: {0}")]
    LookupClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub channel: String,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub max_in_flight: usize,
    pub lookupd_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub msg_timeout: Duration,
}

impl From<&NsqConfig> for ConsumerConfig {
    fn from(nsq: &NsqConfig) -> Self {
        Self {
            topic: nsq.topic.clone(),
            channel: nsq.channel.clone(),
            nsqd_tcp_addresses: nsq.nsqd_tcp_addresses.clone(),
            lookupd_http_addresses: nsq.lookupd_http_addresses.clone(),
            max_in_flight: nsq.max_in_flight,
            lookupd_poll_interval: nsq.lookupd_poll_interval,
            heartbeat_interval: nsq.heartbeat_interval,
            msg_timeout: nsq.msg_timeout,
        }
    }
}

/// Subscribes to a topic/channel on every configured (or discovered) nsqd and
/// feeds admitted messages into one stream.
///
/// The stream closes once `shutdown` fires and every connection has stopped
/// delivering.
pub struct Consumer {
    tasks: JoinSet<()>,
}

impl Consumer {
    pub fn start(
        config: ConsumerConfig,
        flow: FlowController,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<Message>), ConsumerError> {
        if config.nsqd_tcp_addresses.is_empty() && config.lookupd_http_addresses.is_empty() {
            return Err(ConsumerError::NoAddresses);
        }

        let (deliver, messages) = mpsc::channel(flow.capacity());
        let conn_config = Arc::new(ConnectionConfig {
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            identify: identify(&config),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: CONNECT_TIMEOUT,
        });
        let mut tasks = JoinSet::new();

        if !config.nsqd_tcp_addresses.is_empty() {
            let rdy = rdy_per_connection(config.max_in_flight, config.nsqd_tcp_addresses.len());
            for address in &config.nsqd_tcp_addresses {
                tasks.spawn(maintain_connection(
                    address.clone(),
                    conn_config.clone(),
                    rdy,
                    flow.clone(),
                    deliver.clone(),
                    shutdown.clone(),
                ));
            }
        } else {
            let lookup = LookupClient::new(LOOKUP_TIMEOUT)?;
            tasks.spawn(discover(
                config,
                lookup,
                conn_config,
                flow,
                deliver,
                shutdown,
            ));
        }

        Ok((Self { tasks }, messages))
    }

    /// Wait for every connection to close.
    pub async fn wait(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task failed");
            }
        }
    }
}

/// Split the in-flight budget across connections, at least one each.
pub fn rdy_per_connection(max_in_flight: usize, connections: usize) -> u32 {
    let share = max_in_flight / connections.max(1);
    share.clamp(1, u32::MAX as usize) as u32
}

fn identify(config: &ConsumerConfig) -> Identify {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let client_id = hostname.split('.').next().unwrap_or(&hostname).to_string();

    Identify {
        client_id,
        hostname,
        user_agent: crate::USER_AGENT.to_string(),
        feature_negotiation: false,
        heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
        msg_timeout: config.msg_timeout.as_millis() as u64,
    }
}

/// Keep one directly-configured nsqd connected until shutdown, reconnecting
/// with exponential backoff.
///
/// Our `deliver` handle is released as soon as shutdown fires: the connection
/// only finishes once its messages are resolved, and the supervisor resolves
/// the last of them after the stream closes.
async fn maintain_connection(
    address: String,
    config: Arc<ConnectionConfig>,
    rdy: u32,
    flow: FlowController,
    deliver: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    let mut deliver = Some(deliver);
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        let Some(sender) = deliver.clone() else {
            return;
        };
        let started = Instant::now();
        let run = connection::run(&address, &config, rdy, flow.clone(), sender, shutdown.clone());
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = shutdown.cancelled() => {
                deliver = None;
                run.await
            }
        };

        match result {
            Ok(()) => return,
            Err(e) if shutdown.is_cancelled() => {
                warn!(address = %address, error = %e, "Connection failed during shutdown");
                return;
            }
            Err(e) => {
                if started.elapsed() > MAX_RECONNECT_DELAY {
                    delay = INITIAL_RECONNECT_DELAY;
                }
                warn!(
                    address = %address,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connection lost, reconnecting"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
    }
}

/// Poll nsqlookupd for producers of the topic and connect to new ones.
/// A producer whose connection ends is forgotten and picked up again by the
/// next poll that still lists it.
async fn discover(
    config: ConsumerConfig,
    lookup: LookupClient,
    conn_config: Arc<ConnectionConfig>,
    flow: FlowController,
    deliver: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    let mut known: HashSet<String> = HashSet::new();
    let mut connections: JoinSet<String> = JoinSet::new();
    let mut ticker = tokio::time::interval(config.lookupd_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let found = poll_lookupds(&lookup, &config).await;
                let new: Vec<String> = found.into_iter().filter(|a| !known.contains(a)).collect();
                if new.is_empty() {
                    continue;
                }

                let rdy = rdy_per_connection(config.max_in_flight, known.len() + new.len());
                for address in new {
                    info!(address = %address, "Discovered nsqd producer");
                    known.insert(address.clone());
                    let conn_config = conn_config.clone();
                    let flow = flow.clone();
                    let deliver = deliver.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = connection::run(&address, &conn_config, rdy, flow, deliver, shutdown).await {
                            warn!(address = %address, error = %e, "Producer connection ended");
                        }
                        address
                    });
                }
            }

            Some(joined) = connections.join_next() => match joined {
                Ok(address) => {
                    debug!(address = %address, "Forgetting producer");
                    known.remove(&address);
                }
                Err(e) => error!(error = %e, "Producer connection task failed"),
            },
        }
    }

    drop(deliver);
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Producer connection task failed");
        }
    }
}

/// Union of producers reported by every reachable nsqlookupd.
async fn poll_lookupds(lookup: &LookupClient, config: &ConsumerConfig) -> HashSet<String> {
    let mut found = HashSet::new();
    for address in &config.lookupd_http_addresses {
        match lookup.producers(address, &config.topic).await {
            Ok(producers) => {
                debug!(lookupd = %address, count = producers.len(), "Lookup succeeded");
                found.extend(producers);
            }
            Err(e) => warn!(lookupd = %address, error = %e, "Lookup failed"),
        }
    }
    found
}

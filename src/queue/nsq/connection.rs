//! A single subscribed connection to one nsqd.

use super::protocol::{
    read_frame, Command, Frame, Identify, ProtocolError, CLOSE_WAIT, MAGIC_V2, OK,
};
use crate::pipeline::flow::{Admission, FlowController};
use crate::queue::{Message, MessageId, Responder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("{address} rejected {command}: {reason}")]
    Handshake {
        address: String,
        command: &'static str,
        reason: String,
    },

    #[error("protocol error on {address}: {source}")]
    Protocol {
        address: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{0} closed the connection")]
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub topic: String,
    pub channel: String,
    pub identify: Identify,
    pub max_frame_size: usize,
    pub connect_timeout: Duration,
}

/// Routes message resolutions back to the connection they arrived on.
struct NsqResponder {
    address: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Responder for NsqResponder {
    fn finish(&self, id: &MessageId) {
        if self.commands.send(Command::Fin(*id)).is_err() {
            warn!(address = %self.address, message_id = %id, "Connection gone, FIN not sent");
        }
    }

    fn requeue(&self, id: &MessageId, delay: Duration) {
        if self.commands.send(Command::Req(*id, delay)).is_err() {
            warn!(address = %self.address, message_id = %id, "Connection gone, REQ not sent");
        }
    }
}

/// Connect, subscribe and pump messages into `deliver` until shutdown.
///
/// Every message is admitted through `flow` before it is delivered. When no
/// credit is available the connection sends `RDY 0` and holds the messages
/// nsqd already pushed until credits come back. On shutdown it sends
/// `RDY 0` and `CLS`, requeues anything it still holds and stays open until
/// every delivered message has been resolved.
pub async fn run(
    address: &str,
    config: &ConnectionConfig,
    rdy: u32,
    flow: FlowController,
    deliver: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError> {
    let (reader, mut writer) = handshake(address, config).await?;
    send(address, &mut writer, &Command::Rdy(rdy)).await?;
    info!(address, topic = %config.topic, channel = %config.channel, rdy, "Subscribed");

    let (frame_tx, mut frames) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_frames(reader, config.max_frame_size, frame_tx));

    let (command_tx, mut commands) = mpsc::unbounded_channel();
    let mut session = Session {
        address,
        rdy,
        responder: Some(Arc::new(NsqResponder {
            address: Arc::from(address),
            commands: command_tx,
        })),
        deliver: Some(deliver),
        stalled: VecDeque::new(),
    };

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled(), if !session.is_draining() => {
                if let Err(e) = session.begin_drain(&mut writer).await {
                    break Err(e);
                }
            }

            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = send(address, &mut writer, &command).await {
                        break Err(e);
                    }
                }
                // Every message from this connection has been resolved
                None => break Ok(()),
            },

            frame = frames.recv() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = session.on_frame(&mut writer, &flow, frame).await {
                        break Err(e);
                    }
                }
                Some(Err(source)) => break Err(ConnectionError::Protocol {
                    address: address.to_string(),
                    source,
                }),
                None => break Err(ConnectionError::Closed(address.to_string())),
            },

            credit = flow.admit(), if session.is_stalled() => match credit {
                Some(credit) => {
                    if let Err(e) = session.release_stalled(&mut writer, credit).await {
                        break Err(e);
                    }
                }
                None => {
                    if let Err(e) = session.begin_drain(&mut writer).await {
                        break Err(e);
                    }
                }
            },
        }
    };

    reader_task.abort();
    if result.is_ok() {
        let _ = writer.shutdown().await;
        info!(address, "Connection closed");
    }
    result
}

/// Per-connection state for the message loop.
struct Session<'a> {
    address: &'a str,
    rdy: u32,
    /// Dropped when draining so the command channel closes once every
    /// outstanding message has been resolved.
    responder: Option<Arc<NsqResponder>>,
    deliver: Option<mpsc::Sender<Message>>,
    /// Messages pushed by nsqd while no credit was available
    stalled: VecDeque<Message>,
}

impl Session<'_> {
    fn is_draining(&self) -> bool {
        self.responder.is_none()
    }

    fn is_stalled(&self) -> bool {
        !self.stalled.is_empty() && !self.is_draining()
    }

    async fn on_frame(
        &mut self,
        writer: &mut OwnedWriteHalf,
        flow: &FlowController,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        match frame {
            ref f if f.is_heartbeat() => {
                debug!(address = self.address, "Heartbeat");
                send(self.address, writer, &Command::Nop).await
            }
            Frame::Response(data) => {
                if data.as_ref() == CLOSE_WAIT {
                    debug!(address = self.address, "nsqd acknowledged CLS");
                } else {
                    debug!(address = self.address, response = %String::from_utf8_lossy(&data), "Response");
                }
                Ok(())
            }
            Frame::Error(data) => {
                warn!(address = self.address, error = %String::from_utf8_lossy(&data), "nsqd error");
                Ok(())
            }
            Frame::Message(raw) => {
                let Some(responder) = &self.responder else {
                    // Pushed before nsqd saw our RDY 0
                    debug!(address = self.address, message_id = %raw.id, "Requeueing message received while draining");
                    return send(self.address, writer, &Command::Req(raw.id, Duration::ZERO)).await;
                };

                let message = Message::new(
                    raw.id,
                    raw.body,
                    raw.attempts,
                    DateTime::<Utc>::from_timestamp_nanos(raw.timestamp),
                    responder.clone(),
                );

                if !self.stalled.is_empty() {
                    self.stalled.push_back(message);
                    return Ok(());
                }

                match flow.try_admit() {
                    Admission::Granted(credit) => {
                        self.deliver(writer, message.with_credit(credit)).await
                    }
                    Admission::Denied => {
                        debug!(address = self.address, in_flight = flow.in_flight(), "Flow credit exhausted, pausing");
                        self.stalled.push_back(message);
                        send(self.address, writer, &Command::Rdy(0)).await
                    }
                }
            }
        }
    }

    async fn release_stalled(
        &mut self,
        writer: &mut OwnedWriteHalf,
        credit: crate::pipeline::flow::Credit,
    ) -> Result<(), ConnectionError> {
        let Some(message) = self.stalled.pop_front() else {
            return Ok(());
        };
        self.deliver(writer, message.with_credit(credit)).await?;

        if self.stalled.is_empty() && !self.is_draining() {
            debug!(address = self.address, rdy = self.rdy, "Flow credit available, resuming");
            send(self.address, writer, &Command::Rdy(self.rdy)).await?;
        }
        Ok(())
    }

    async fn deliver(
        &mut self,
        writer: &mut OwnedWriteHalf,
        message: Message,
    ) -> Result<(), ConnectionError> {
        let Some(deliver) = &self.deliver else {
            message.requeue(Duration::ZERO);
            return Ok(());
        };

        if let Err(mpsc::error::SendError(message)) = deliver.send(message).await {
            warn!(address = self.address, "Pipeline stopped accepting messages");
            message.requeue(Duration::ZERO);
            self.begin_drain(writer).await?;
        }
        Ok(())
    }

    /// Stop receiving, hand back held messages and let outstanding ones
    /// resolve.
    async fn begin_drain(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ConnectionError> {
        if self.is_draining() {
            return Ok(());
        }
        info!(address = self.address, held = self.stalled.len(), "Closing connection");

        send(self.address, writer, &Command::Rdy(0)).await?;
        send(self.address, writer, &Command::Cls).await?;

        for message in self.stalled.drain(..) {
            message.requeue(Duration::ZERO);
        }
        self.deliver = None;
        self.responder = None;
        Ok(())
    }
}

async fn handshake(
    address: &str,
    config: &ConnectionConfig,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), ConnectionError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(address.to_string()))?
        .map_err(|source| ConnectionError::Connect {
            address: address.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    writer
        .write_all(MAGIC_V2)
        .await
        .map_err(|source| protocol_error(address, source.into()))?;

    send(address, &mut writer, &Command::Identify(config.identify.clone())).await?;
    expect_ok(address, &mut reader, config.max_frame_size, "IDENTIFY").await?;

    let sub = Command::Sub {
        topic: config.topic.clone(),
        channel: config.channel.clone(),
    };
    send(address, &mut writer, &sub).await?;
    expect_ok(address, &mut reader, config.max_frame_size, "SUB").await?;

    Ok((reader, writer))
}

async fn expect_ok(
    address: &str,
    reader: &mut OwnedReadHalf,
    max_frame_size: usize,
    command: &'static str,
) -> Result<(), ConnectionError> {
    loop {
        let frame = read_frame(reader, max_frame_size)
            .await
            .map_err(|source| protocol_error(address, source))?;

        let reason = match frame {
            Some(Frame::Response(ref data)) if data.as_ref() == OK => return Ok(()),
            Some(ref f) if f.is_heartbeat() => continue,
            Some(Frame::Response(data)) | Some(Frame::Error(data)) => {
                String::from_utf8_lossy(&data).into_owned()
            }
            Some(Frame::Message(_)) => "unexpected message before subscription".to_string(),
            None => "connection closed".to_string(),
        };
        return Err(ConnectionError::Handshake {
            address: address.to_string(),
            command,
            reason,
        });
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    frames: mpsc::Sender<Result<Frame, ProtocolError>>,
) {
    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn send(
    address: &str,
    writer: &mut OwnedWriteHalf,
    command: &Command,
) -> Result<(), ConnectionError> {
    let bytes: Bytes = command
        .encode()
        .map_err(|source| protocol_error(address, source))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|source| protocol_error(address, source.into()))
}

fn protocol_error(address: &str, source: ProtocolError) -> ConnectionError {
    ConnectionError::Protocol {
        address: address.to_string(),
        source,
    }
}

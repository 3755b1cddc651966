pub mod nsq;

use crate::pipeline::flow::Credit;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Length of an NSQ message ID on the wire.
pub const MESSAGE_ID_LEN: usize = 16;

/// Broker-assigned message identifier (16 printable ASCII bytes in NSQ).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn new(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// The acknowledgment side of a queue connection.
///
/// Implementations must not block: they are called from handler and flush
/// tasks and are expected to enqueue the command for the connection's writer.
pub trait Responder: Send + Sync {
    fn finish(&self, id: &MessageId);
    fn requeue(&self, id: &MessageId, delay: Duration);
}

/// A message delivered by the queue.
///
/// `ack` and `requeue` consume the message, so it can be resolved at most
/// once. A message dropped without being resolved is requeued immediately,
/// so every delivered message is resolved exactly once. The admission credit
/// (if any) is returned to the flow controller when the message goes away.
pub struct Message {
    id: MessageId,
    body: Bytes,
    attempts: u16,
    timestamp: DateTime<Utc>,
    responder: Arc<dyn Responder>,
    credit: Option<Credit>,
    resolved: bool,
}

impl Message {
    pub fn new(
        id: MessageId,
        body: Bytes,
        attempts: u16,
        timestamp: DateTime<Utc>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            id,
            body,
            attempts,
            timestamp,
            responder,
            credit: None,
            resolved: false,
        }
    }

    /// Attach the admission credit that this message holds until resolved.
    pub fn with_credit(mut self, credit: Credit) -> Self {
        self.credit = Some(credit);
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of delivery attempts, including this one.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_admitted(&self) -> bool {
        self.credit.is_some()
    }

    /// Acknowledge (FIN) the message.
    pub fn ack(mut self) {
        self.responder.finish(&self.id);
        self.resolved = true;
    }

    /// Hand the message back to the broker for redelivery after `delay`.
    pub fn requeue(mut self, delay: Duration) {
        self.responder.requeue(&self.id, delay);
        self.resolved = true;
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(message_id = %self.id, "Message dropped unresolved, requeueing");
            self.responder.requeue(&self.id, Duration::ZERO);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .finish()
    }
}

//! NSQ consumer: TCP protocol, per-nsqd connections and nsqlookupd
//! discovery.

pub mod connection;
pub mod consumer;
pub mod lookup;
pub mod protocol;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionConfig, ConnectionError};
pub use consumer::{Consumer, ConsumerConfig, ConsumerError};
pub use lookup::{LookupClient, LookupError};

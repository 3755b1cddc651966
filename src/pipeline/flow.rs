use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Credit-based admission gate bounding how many messages are in flight.
///
/// Clones share the same pool of credits. A credit is held by the admitted
/// message until it is acked or requeued.
#[derive(Debug, Clone)]
pub struct FlowController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of in-flight capacity. Returned to the pool on drop.
#[derive(Debug)]
pub struct Credit {
    _permit: OwnedSemaphorePermit,
}

impl Credit {
    /// Return the credit explicitly.
    pub fn release(self) {}
}

#[derive(Debug)]
pub enum Admission {
    Granted(Credit),
    Denied,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

impl FlowController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of credits currently held by admitted messages.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Non-blocking admission. Always denied once closed.
    pub fn try_admit(&self) -> Admission {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Admission::Granted(Credit { _permit: permit }),
            Err(_) => Admission::Denied,
        }
    }

    /// Wait for a credit. Returns `None` once the controller is closed,
    /// including for callers already waiting.
    pub async fn admit(&self) -> Option<Credit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Credit { _permit: permit })
    }

    /// Stop granting credits. Outstanding credits can still be returned.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

use crate::pipeline::decoder::Record;
use crate::queue::Message;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A decoded record together with the message it came from.
#[derive(Debug)]
pub struct PendingRow {
    pub record: Record,
    pub message: Message,
}

/// A closed or open group of rows destined for one insert call.
#[derive(Debug)]
pub struct Batch {
    /// Unique batch ID (for log correlation)
    pub id: Uuid,

    /// When the first row was added
    pub created_at: Instant,

    /// Rows in arrival order; flush outcomes align with this order
    pub rows: Vec<PendingRow>,

    /// Sum of the raw payload sizes
    pub bytes: usize,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            rows: Vec::with_capacity(capacity),
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

#[derive(Debug)]
pub enum AddOutcome {
    /// This add filled the batch; the caller owns it and must flush it.
    Full(Batch),
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub time_before_flush: Duration,
}

/// Buffers decoded rows and decides when a batch is ready.
///
/// `add`, `check_timeout` and `drain` share one critical section, so exactly
/// one caller receives each closed batch and later rows land in the
/// replacement.
pub struct BatchAccumulator {
    limits: BatchLimits,
    open: Mutex<Batch>,
}

impl BatchAccumulator {
    pub fn new(limits: BatchLimits) -> Self {
        let limits = BatchLimits {
            max_rows: limits.max_rows.max(1),
            ..limits
        };
        Self {
            open: Mutex::new(Batch::new(limits.max_rows)),
            limits,
        }
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    pub fn add(&self, record: Record, message: Message) -> AddOutcome {
        let size = message.body().len();
        let mut open = self.lock();

        if open.is_empty() {
            open.created_at = Instant::now();
        }
        open.bytes += size;
        open.rows.push(PendingRow { record, message });

        if open.len() >= self.limits.max_rows || open.bytes >= self.limits.max_bytes {
            AddOutcome::Full(self.swap(&mut open))
        } else {
            AddOutcome::Pending
        }
    }

    /// Close the open batch if its oldest row has waited `time_before_flush`.
    pub fn check_timeout(&self) -> Option<Batch> {
        self.check_timeout_at(Instant::now())
    }

    pub fn check_timeout_at(&self, now: Instant) -> Option<Batch> {
        let mut open = self.lock();
        if !open.is_empty() && open.age(now) >= self.limits.time_before_flush {
            Some(self.swap(&mut open))
        } else {
            None
        }
    }

    /// Close the open batch regardless of thresholds.
    pub fn drain(&self) -> Option<Batch> {
        let mut open = self.lock();
        if open.is_empty() {
            None
        } else {
            Some(self.swap(&mut open))
        }
    }

    /// Rows currently buffered in the open batch.
    pub fn buffered(&self) -> usize {
        self.lock().len()
    }

    fn swap(&self, open: &mut Batch) -> Batch {
        std::mem::replace(open, Batch::new(self.limits.max_rows))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Batch> {
        // A panic while holding the lock cannot leave a half-swapped batch,
        // so the data is still consistent.
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decoder::decode;
    use crate::queue::testing::RecordingResponder;
    use std::sync::Arc;

    fn limits(max_rows: usize) -> BatchLimits {
        BatchLimits {
            max_rows,
            max_bytes: usize::MAX,
            time_before_flush: Duration::from_secs(60),
        }
    }

    fn row(responder: &Arc<RecordingResponder>, n: usize) -> (Record, Message) {
        let body = format!(r#"{{"n": {}}}"#, n);
        (decode(body.as_bytes()).unwrap(), responder.message(&body))
    }

    fn resolve_all(batch: Batch) {
        for row in batch.rows {
            row.message.ack();
        }
    }

    #[test]
    fn test_full_at_max_rows_and_swaps() {
        let responder = RecordingResponder::new();
        let acc = BatchAccumulator::new(limits(3));

        for n in 0..2 {
            let (record, msg) = row(&responder, n);
            assert!(matches!(acc.add(record, msg), AddOutcome::Pending));
        }

        let (record, msg) = row(&responder, 2);
        let AddOutcome::Full(batch) = acc.add(record, msg) else {
            panic!("expected full batch");
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.rows[0].record["n"], 0);
        assert_eq!(batch.rows[2].record["n"], 2);
        assert_eq!(acc.buffered(), 0);

        let (record, msg) = row(&responder, 3);
        assert!(matches!(acc.add(record, msg), AddOutcome::Pending));
        assert_eq!(acc.buffered(), 1);

        resolve_all(batch);
        resolve_all(acc.drain().unwrap());
    }

    #[test]
    fn test_full_at_max_bytes() {
        let responder = RecordingResponder::new();
        let acc = BatchAccumulator::new(BatchLimits {
            max_rows: 100,
            max_bytes: 20,
            time_before_flush: Duration::from_secs(60),
        });

        let (record, msg) = row(&responder, 1); // 8 bytes
        assert!(matches!(acc.add(record, msg), AddOutcome::Pending));
        let (record, msg) = row(&responder, 2);
        assert!(matches!(acc.add(record, msg), AddOutcome::Pending));
        let (record, msg) = row(&responder, 3);
        let AddOutcome::Full(batch) = acc.add(record, msg) else {
            panic!("expected byte threshold to close batch");
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.bytes, 24);
        resolve_all(batch);
    }

    #[test]
    fn test_timeout_only_when_overdue() {
        let responder = RecordingResponder::new();
        let acc = BatchAccumulator::new(BatchLimits {
            max_rows: 100,
            max_bytes: usize::MAX,
            time_before_flush: Duration::from_secs(5),
        });

        // Empty batches never time out
        assert!(acc.check_timeout_at(Instant::now() + Duration::from_secs(60)).is_none());

        for n in 0..3 {
            let (record, msg) = row(&responder, n);
            acc.add(record, msg);
        }

        let start = Instant::now();
        assert!(acc.check_timeout_at(start + Duration::from_secs(1)).is_none());

        let batch = acc
            .check_timeout_at(start + Duration::from_secs(6))
            .expect("batch should be overdue");
        assert_eq!(batch.len(), 3);
        assert!(acc.drain().is_none());
        resolve_all(batch);
    }

    #[test]
    fn test_age_starts_at_first_row() {
        let responder = RecordingResponder::new();
        let acc = BatchAccumulator::new(BatchLimits {
            max_rows: 100,
            max_bytes: usize::MAX,
            time_before_flush: Duration::from_millis(50),
        });

        // Idle time before the first row does not count
        std::thread::sleep(Duration::from_millis(60));
        let (record, msg) = row(&responder, 0);
        acc.add(record, msg);
        assert!(acc.check_timeout().is_none());

        resolve_all(acc.drain().unwrap());
    }

    #[test]
    fn test_drain_returns_partial_batch() {
        let responder = RecordingResponder::new();
        let acc = BatchAccumulator::new(limits(100));
        assert!(acc.drain().is_none());

        for n in 0..7 {
            let (record, msg) = row(&responder, n);
            acc.add(record, msg);
        }

        let batch = acc.drain().unwrap();
        assert_eq!(batch.len(), 7);
        assert!(acc.drain().is_none());
        resolve_all(batch);
    }

    #[test]
    fn test_concurrent_adds_hand_off_each_batch_once() {
        let responder = RecordingResponder::new();
        let acc = Arc::new(BatchAccumulator::new(limits(100)));
        let full = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let acc = Arc::clone(&acc);
                let full = Arc::clone(&full);
                let responder = Arc::clone(&responder);
                std::thread::spawn(move || {
                    for n in 0..125 {
                        let (record, msg) = row(&responder, t * 1000 + n);
                        if let AddOutcome::Full(batch) = acc.add(record, msg) {
                            full.lock().unwrap().push(batch);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let batches = std::mem::take(&mut *full.lock().unwrap());
        assert_eq!(batches.len(), 10);
        assert!(batches.iter().all(|b| b.len() == 100));
        assert_eq!(acc.buffered(), 0);

        for batch in batches {
            resolve_all(batch);
        }
        assert_eq!(responder.finished(), 1000);
        assert_eq!(responder.requeued(), 0);
    }
}

//! Time primitives: injectable time source, deadlines, cancellation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

/// Zero-time sentinel. Absent timer timestamps normalize to this value
/// before every persist so that round-trips through the shard row are
/// deterministic.
pub const ZERO_TIME: SystemTime = UNIX_EPOCH;

/// Source of wall-clock time. Injected so tests can drive the clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Truncate to whole milliseconds since the epoch.
pub fn truncate_to_ms(t: SystemTime) -> SystemTime {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    UNIX_EPOCH + Duration::from_millis(since.as_millis() as u64)
}

pub fn max_time(a: SystemTime, b: SystemTime) -> SystemTime {
    if a > b { a } else { b }
}

/// Decode a persisted ack level into a timestamp. Zero (and anything
/// negative) decodes to the zero-time sentinel.
pub fn unix_or_zero_time(nanos: i64) -> SystemTime {
    if nanos <= 0 {
        return ZERO_TIME;
    }
    UNIX_EPOCH + Duration::from_nanos(nanos as u64)
}

/// Encode a timestamp as nanoseconds since the epoch. Pre-epoch times
/// encode as zero.
pub fn to_unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// A call deadline. `Deadline::none()` means unbounded.
///
/// Persistence calls block the calling thread until completion or until
/// the driver observes the deadline, so every store method takes one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(d: Duration) -> Self {
        Self {
            at: Some(Instant::now() + d),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// Remaining budget, `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

/// Cancellation token shared between the shard context and any I/O that
/// honors it. Cancelled exactly once, at stop.
///
/// Backed by a crossbeam channel that is never sent on: dropping the
/// sender wakes every receiver, which makes `wait_timeout` a cancellable
/// sleep.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            rx,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `d` or until cancelled. Returns true if cancelled.
    pub fn wait_timeout(&self, d: Duration) -> bool {
        matches!(self.rx.recv_timeout(d), Err(RecvTimeoutError::Disconnected))
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

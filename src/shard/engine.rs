//! Engine lifecycle coupling.
//!
//! The workflow engine and the shard context reference each other. The
//! context owns the engine through a write-once slot; engines keep a
//! weak back-reference. The slot doubles as a future: readers block
//! until the first acquisition sets it, or until stop poisons it.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::{CancelToken, ClusterName, Deadline, TasksByCategory};

use super::context::ShardContext;
use super::ShardError;

/// The workflow engine driven by this shard. Started exactly once after
/// the first successful acquisition, stopped exactly once at shutdown.
pub trait Engine: Send + Sync {
    fn start(&self);
    fn stop(&self);

    /// Called after the guard is released, for every mutation that
    /// possibly succeeded.
    fn notify_new_tasks(&self, cluster: &ClusterName, tasks: &TasksByCategory);
}

pub trait EngineFactory: Send + Sync {
    fn create_engine(&self, shard: &Arc<ShardContext>) -> Arc<dyn Engine>;
}

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Write-once engine slot, readable by any thread.
pub(crate) struct EngineCell {
    slot: Mutex<Option<Result<Arc<dyn Engine>, ShardError>>>,
    cond: Condvar,
}

impl EngineCell {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// First write wins; later writes are ignored.
    pub(crate) fn set(&self, value: Result<Arc<dyn Engine>, ShardError>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(value);
            self.cond.notify_all();
        }
    }

    /// Non-blocking read; used by the stop path, which must not wait.
    pub(crate) fn try_get(&self) -> Option<Result<Arc<dyn Engine>, ShardError>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Block until the slot is set, the deadline passes, or the
    /// lifecycle token fires.
    pub(crate) fn get(
        &self,
        deadline: Deadline,
        lifecycle: &CancelToken,
    ) -> Result<Arc<dyn Engine>, ShardError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            if lifecycle.is_cancelled() {
                return Err(ShardError::ShardClosed);
            }
            if deadline.expired() {
                return Err(ShardError::DeadlineExceeded);
            }
            let slice = deadline
                .remaining()
                .map_or(WAIT_SLICE, |remaining| remaining.min(WAIT_SLICE));
            let (guard, _timeout) = self
                .cond
                .wait_timeout(slot, slice)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopEngine;

    impl Engine for NoopEngine {
        fn start(&self) {}
        fn stop(&self) {}
        fn notify_new_tasks(&self, _cluster: &ClusterName, _tasks: &TasksByCategory) {}
    }

    #[test]
    fn first_set_wins() {
        let cell = EngineCell::new();
        assert!(!cell.ready());
        cell.set(Ok(Arc::new(NoopEngine)));
        assert!(cell.ready());
        cell.set(Err(ShardError::StoppingContext));
        assert!(cell.try_get().unwrap().is_ok());
    }

    #[test]
    fn get_blocks_until_set() {
        let cell = Arc::new(EngineCell::new());
        let lifecycle = CancelToken::new();

        let waiter = Arc::clone(&cell);
        let waiter_token = lifecycle.clone();
        let handle = std::thread::spawn(move || waiter.get(Deadline::none(), &waiter_token));

        std::thread::sleep(Duration::from_millis(20));
        cell.set(Ok(Arc::new(NoopEngine)));
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn cancelled_lifecycle_unblocks_readers() {
        let cell = EngineCell::new();
        let lifecycle = CancelToken::new();
        lifecycle.cancel();
        let err = cell.get(Deadline::none(), &lifecycle).err().unwrap();
        assert!(matches!(err, ShardError::ShardClosed));
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let cell = EngineCell::new();
        let lifecycle = CancelToken::new();
        let err = cell
            .get(Deadline::after(Duration::from_millis(10)), &lifecycle)
            .err()
            .unwrap();
        assert!(matches!(err, ShardError::DeadlineExceeded));
    }
}

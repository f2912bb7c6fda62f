//! The shard context: in-memory owner of one shard.
//!
//! Provides:
//! - Leased-ownership state machine with background re-acquisition
//! - Monotonic task-id allocation with reservation windows
//! - Per-queue ack-level and failover-level registry
//! - The workflow-mutation write pipeline and deletion pipeline
//! - Engine lifecycle coupling

mod acks;
mod context;
mod engine;
mod writes;

pub use context::{
    HandoverInfo, RemoteClusterInfo, ShardContext, ShardParams, ShardReplicationStatus,
};
pub use engine::{Engine, EngineFactory};

use thiserror::Error;

use crate::core::RegistryError;
use crate::error::{Effect, Transience, registry_transience};
use crate::persistence::StoreError;

/// Errors returned by shard-context operations.
///
/// Store errors pass through unchanged so callers can classify the
/// outcome themselves; the status variants report why the shard refused
/// to serve at all.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ShardError {
    /// The shard has been stopped on this host and will not come back.
    #[error("shard closed")]
    ShardClosed,

    /// We are not sure whether we hold the range lease. Returned during
    /// short windows at initialization and while re-acquiring.
    #[error("shard status unknown")]
    ShardStatusUnknown,

    /// Internal sentinel: the context started stopping while the
    /// acquisition loop was running. The loop exits silently on it.
    #[error("stopping shard context")]
    StoppingContext,

    /// The caller's deadline had already expired before any work began.
    #[error("deadline expired")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ShardError {
    pub fn transience(&self) -> Transience {
        match self {
            ShardError::Store(e) => e.transience(),
            ShardError::Registry(e) => registry_transience(e),
            ShardError::ShardStatusUnknown | ShardError::DeadlineExceeded => Transience::Retryable,
            ShardError::ShardClosed | ShardError::StoppingContext => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ShardError::Store(e) => e.effect(),
            _ => Effect::None,
        }
    }

    /// False only when we can prove no persistence side effect landed.
    pub fn possibly_succeeded(&self) -> bool {
        match self {
            ShardError::Store(e) => e.possibly_succeeded(),
            _ => false,
        }
    }
}

/// Classification used by the write pipeline to decide whether to fire
/// engine notifications after the guard is released.
pub fn operation_possibly_succeeded<T>(result: &Result<T, ShardError>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => err.possibly_succeeded(),
    }
}

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::RegistryError;
use crate::persistence::StoreError;
use crate::shard::ShardError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
///
/// The write pipeline keys off this: a definite failure (`None`)
/// suppresses engine notification, anything else counts as "possibly
/// succeeded" and downstream effects must still fire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the canonical capability
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Shard(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Registry(e) => registry_transience(e),
            Error::Config(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Shard(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Registry(_) | Error::Config(_) => Effect::None,
        }
    }
}

pub(crate) fn registry_transience(err: &RegistryError) -> Transience {
    match err {
        RegistryError::NotFound(_) => Transience::Permanent,
        RegistryError::Unavailable(_) => Transience::Retryable,
    }
}

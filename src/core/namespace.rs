//! Namespace identity and registry contract.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::cluster::ClusterName;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(Uuid);

impl NamespaceId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceId({})", self.0)
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run identity of a single workflow execution.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication state of a namespace. `Handover` marks an in-progress
/// active-cluster change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    Normal,
    Handover,
}

/// Registry entry for one namespace.
#[derive(Clone, Debug)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    pub global: bool,
    pub replication_state: ReplicationState,
    pub active_cluster: ClusterName,
    pub notification_version: i64,
}

impl Namespace {
    pub fn is_handover(&self) -> bool {
        self.global && self.replication_state == ReplicationState::Handover
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("namespace not found: {0}")]
    NotFound(NamespaceId),

    #[error("namespace registry unavailable: {0}")]
    Unavailable(String),
}

/// Lookup into the namespace cache. Resolved outside the shard guard;
/// the deletion pipeline branches on `NotFound` (namespace deletion in
/// progress).
pub trait NamespaceRegistry: Send + Sync {
    fn namespace_by_id(&self, id: &NamespaceId) -> Result<Arc<Namespace>, RegistryError>;
}

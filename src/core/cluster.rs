//! Cluster topology metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a cluster participating in cross-cluster replication.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterName({:?})", self.0)
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub enabled: bool,
}

/// Static view of the cluster topology: the local cluster plus every
/// cluster this deployment knows about. Constant from initialization.
#[derive(Clone, Debug)]
pub struct ClusterMetadata {
    current: ClusterName,
    clusters: BTreeMap<ClusterName, ClusterInfo>,
}

impl ClusterMetadata {
    pub fn new(current: ClusterName, mut clusters: BTreeMap<ClusterName, ClusterInfo>) -> Self {
        clusters
            .entry(current.clone())
            .or_insert(ClusterInfo { enabled: true });
        Self { current, clusters }
    }

    /// Single-cluster deployment.
    pub fn single(current: ClusterName) -> Self {
        Self::new(current, BTreeMap::new())
    }

    pub fn current_cluster_name(&self) -> &ClusterName {
        &self.current
    }

    pub fn is_current(&self, cluster: &ClusterName) -> bool {
        *cluster == self.current
    }

    pub fn all_cluster_info(&self) -> &BTreeMap<ClusterName, ClusterInfo> {
        &self.clusters
    }
}

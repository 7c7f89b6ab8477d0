//! Cluster collaborator.
//!
//! The control plane needs four things from the cluster: read and write the
//! config object holding the manifest, list the component groups carrying a
//! label, and scale a group. [`ClusterApi`] captures exactly that surface.

mod kubernetes;
mod memory;

pub use kubernetes::KubernetesClient;
pub use memory::{MemoryCluster, ScaleEvent};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ClusterBackend, ClusterConfig};
use crate::error::ControlResult;

/// Controller kind managing a component group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Stateful set.
    StatefulSet,
    /// Deployment.
    Deployment,
}

impl GroupKind {
    /// All kinds, in the order restarts visit them.
    pub const ALL: [Self; 2] = [Self::StatefulSet, Self::Deployment];

    /// Lowercase singular name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StatefulSet => "statefulset",
            Self::Deployment => "deployment",
        }
    }

    /// Plural resource name used in API paths.
    #[must_use]
    pub const fn resource(self) -> &'static str {
        match self {
            Self::StatefulSet => "statefulsets",
            Self::Deployment => "deployments",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster-managed replica set matched by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentGroup {
    /// Controller kind.
    pub kind: GroupKind,
    /// Group name.
    pub name: String,
    /// Desired replica count, if set.
    pub replicas: Option<i32>,
}

impl ComponentGroup {
    /// `kind/name` label for logs and summaries.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Snapshot of a config object's data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    /// Key/value data.
    pub data: BTreeMap<String, String>,
    /// Store version token; writes are conditional on it when present.
    pub version: Option<String>,
}

/// Operations the control plane performs against the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a config object.
    ///
    /// Returns [`ControlError::ConfigNotFound`](crate::ControlError::ConfigNotFound)
    /// if it does not exist.
    async fn read_config(&self, name: &str, namespace: &str) -> ControlResult<ConfigDocument>;

    /// Replace a config object's data.
    ///
    /// When `document.version` is set and no longer current, fails with
    /// [`ControlError::ManifestConflict`](crate::ControlError::ManifestConflict).
    async fn write_config(
        &self,
        name: &str,
        namespace: &str,
        document: &ConfigDocument,
    ) -> ControlResult<()>;

    /// List groups of one kind matching a label selector.
    async fn list_groups(
        &self,
        kind: GroupKind,
        namespace: &str,
        label_selector: &str,
    ) -> ControlResult<Vec<ComponentGroup>>;

    /// Set a group's desired replica count.
    async fn scale_group(
        &self,
        kind: GroupKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> ControlResult<()>;
}

/// Create a cluster collaborator from configuration.
pub fn create_cluster(config: &ClusterConfig) -> ControlResult<Arc<dyn ClusterApi>> {
    match config.backend {
        ClusterBackend::Kubernetes => Ok(Arc::new(KubernetesClient::new(config)?)),
        ClusterBackend::Memory => {
            let cluster = MemoryCluster::new();
            cluster.insert_config(&config.namespace, &config.config_map, BTreeMap::new());
            Ok(Arc::new(cluster))
        }
    }
}

//! In-memory cluster for development and testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};

use super::{ClusterApi, ComponentGroup, ConfigDocument, GroupKind};

/// A replica change applied to the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleEvent {
    /// Controller kind.
    pub kind: GroupKind,
    /// Group name.
    pub name: String,
    /// Replica count written.
    pub replicas: i32,
}

#[derive(Debug, Clone)]
struct StoredConfig {
    data: BTreeMap<String, String>,
    version: u64,
}

#[derive(Debug, Clone)]
struct StoredGroup {
    kind: GroupKind,
    namespace: String,
    name: String,
    labels: BTreeMap<String, String>,
    replicas: Option<i32>,
}

#[derive(Debug, Default)]
struct ClusterState {
    configs: HashMap<(String, String), StoredConfig>,
    groups: Vec<StoredGroup>,
    scale_log: Vec<ScaleEvent>,
    failing_scales: HashSet<String>,
    failing_lists: bool,
    pending_conflicts: usize,
}

/// In-memory cluster.
///
/// Data is lost when the process exits. Failure injection helpers allow
/// tests to exercise partial-failure paths.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    /// Create or replace a config object.
    pub fn insert_config(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.with_state(|state| {
            state.configs.insert(
                (namespace.to_owned(), name.to_owned()),
                StoredConfig { data, version: 1 },
            );
        });
    }

    /// Current data of a config object.
    #[must_use]
    pub fn config_data(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.with_state(|state| {
            state
                .configs
                .get(&(namespace.to_owned(), name.to_owned()))
                .map(|c| c.data.clone())
        })
        .flatten()
    }

    /// Register a component group.
    pub fn add_group(
        &self,
        kind: GroupKind,
        namespace: &str,
        name: &str,
        labels: &[(&str, &str)],
        replicas: Option<i32>,
    ) {
        let labels = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.with_state(|state| {
            state.groups.push(StoredGroup {
                kind,
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                labels,
                replicas,
            });
        });
    }

    /// Current desired replicas of a group.
    #[must_use]
    pub fn replicas(&self, kind: GroupKind, namespace: &str, name: &str) -> Option<i32> {
        self.with_state(|state| {
            state
                .groups
                .iter()
                .find(|g| g.kind == kind && g.namespace == namespace && g.name == name)
                .and_then(|g| g.replicas)
        })
        .flatten()
    }

    /// Every scale write applied so far, in order.
    #[must_use]
    pub fn scale_log(&self) -> Vec<ScaleEvent> {
        self.with_state(|state| state.scale_log.clone())
            .unwrap_or_default()
    }

    /// Make every scale write to the named group fail.
    pub fn fail_scaling(&self, name: &str) {
        self.with_state(|state| {
            state.failing_scales.insert(name.to_owned());
        });
    }

    /// Make every group listing fail.
    pub fn fail_listing(&self, failing: bool) {
        self.with_state(|state| state.failing_lists = failing);
    }

    /// Simulate concurrent writers: the next `count` conditional writes
    /// find the config already changed.
    pub fn inject_write_conflicts(&self, count: usize) {
        self.with_state(|state| state.pending_conflicts = count);
    }
}

/// Match a `k=v[,k=v...]` equality selector.
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn read_config(&self, name: &str, namespace: &str) -> ControlResult<ConfigDocument> {
        let state = self.lock()?;
        state
            .configs
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|c| ConfigDocument {
                data: c.data.clone(),
                version: Some(c.version.to_string()),
            })
            .ok_or_else(|| ControlError::ConfigNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            })
    }

    async fn write_config(
        &self,
        name: &str,
        namespace: &str,
        document: &ConfigDocument,
    ) -> ControlResult<()> {
        let mut state = self.lock()?;
        let inject_conflict = state.pending_conflicts > 0;
        if inject_conflict {
            state.pending_conflicts -= 1;
        }

        let stored = state
            .configs
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| ControlError::ConfigNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            })?;

        if inject_conflict {
            stored.version += 1;
        }

        if let Some(expected) = &document.version {
            if *expected != stored.version.to_string() {
                return Err(ControlError::ManifestConflict(name.to_owned()));
            }
        }

        stored.data = document.data.clone();
        stored.version += 1;
        Ok(())
    }

    async fn list_groups(
        &self,
        kind: GroupKind,
        namespace: &str,
        label_selector: &str,
    ) -> ControlResult<Vec<ComponentGroup>> {
        let state = self.lock()?;
        if state.failing_lists {
            return Err(ControlError::upstream("control plane unreachable"));
        }

        Ok(state
            .groups
            .iter()
            .filter(|g| {
                g.kind == kind
                    && g.namespace == namespace
                    && selector_matches(label_selector, &g.labels)
            })
            .map(|g| ComponentGroup {
                kind: g.kind,
                name: g.name.clone(),
                replicas: g.replicas,
            })
            .collect())
    }

    async fn scale_group(
        &self,
        kind: GroupKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> ControlResult<()> {
        let mut state = self.lock()?;
        if state.failing_scales.contains(name) {
            return Err(ControlError::upstream(format!("scale {kind}/{name} refused")));
        }

        let group = state
            .groups
            .iter_mut()
            .find(|g| g.kind == kind && g.namespace == namespace && g.name == name)
            .ok_or_else(|| ControlError::upstream(format!("{kind}/{name} not found")))?;
        group.replicas = Some(replicas);

        state.scale_log.push(ScaleEvent {
            kind,
            name: name.to_owned(),
            replicas,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matching() {
        let labels: BTreeMap<_, _> = [("component", "worker"), ("tier", "airflow")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        assert!(selector_matches("component=worker", &labels));
        assert!(selector_matches("component=worker,tier=airflow", &labels));
        assert!(selector_matches("tier", &labels));
        assert!(!selector_matches("component=scheduler", &labels));
        assert!(!selector_matches("component=worker,tier=web", &labels));
    }

    #[tokio::test]
    async fn conditional_write_detects_stale_version() {
        let cluster = MemoryCluster::new();
        cluster.insert_config("ns", "cfg", BTreeMap::new());

        let mut doc = cluster.read_config("cfg", "ns").await.unwrap();
        doc.data.insert("k".to_owned(), "v1".to_owned());
        cluster.write_config("cfg", "ns", &doc).await.unwrap();

        doc.data.insert("k".to_owned(), "v2".to_owned());
        let err = cluster.write_config("cfg", "ns", &doc).await.unwrap_err();
        assert!(matches!(err, ControlError::ManifestConflict(_)));
        assert_eq!(cluster.config_data("ns", "cfg").unwrap()["k"], "v1");

        doc.version = None;
        cluster.write_config("cfg", "ns", &doc).await.unwrap();
        assert_eq!(cluster.config_data("ns", "cfg").unwrap()["k"], "v2");
    }

    #[tokio::test]
    async fn missing_config_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = cluster.read_config("cfg", "ns").await.unwrap_err();
        assert!(matches!(err, ControlError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn list_and_scale_groups() {
        let cluster = MemoryCluster::new();
        cluster.add_group(
            GroupKind::StatefulSet,
            "ns",
            "worker",
            &[("component", "worker")],
            Some(3),
        );
        cluster.add_group(
            GroupKind::Deployment,
            "ns",
            "scheduler",
            &[("component", "scheduler")],
            Some(1),
        );
        cluster.add_group(
            GroupKind::StatefulSet,
            "other",
            "worker",
            &[("component", "worker")],
            Some(2),
        );

        let groups = cluster
            .list_groups(GroupKind::StatefulSet, "ns", "component=worker")
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].replicas, Some(3));

        cluster
            .scale_group(GroupKind::StatefulSet, "worker", "ns", 0)
            .await
            .unwrap();
        assert_eq!(
            cluster.replicas(GroupKind::StatefulSet, "ns", "worker"),
            Some(0)
        );
        assert_eq!(
            cluster.replicas(GroupKind::StatefulSet, "other", "worker"),
            Some(2)
        );
        assert_eq!(cluster.scale_log().len(), 1);
    }
}

//! Rolling restart of component groups.
//!
//! After the manifest changes, every group carrying one of the configured
//! component labels is cycled: scaled to zero, held there for a grace
//! period, then scaled back to its previous size. Groups are processed one
//! at a time, and passes never overlap, so at most one group is down at any
//! moment.

mod tracker;

pub use tracker::{RestartId, RestartRecord, RestartStatus, RestartTracker};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ComponentGroup, GroupKind};
use crate::config::{ClusterConfig, ReplicaPolicy, RestartConfig};
use crate::error::{ControlError, ControlResult};

/// Outcome of a restart pass, by `kind/name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartSummary {
    /// Groups scaled down and restored.
    pub restarted: Vec<String>,
    /// Groups whose scale sequence failed.
    pub failed: Vec<String>,
    /// Groups left untouched by the replica policy.
    pub skipped: Vec<String>,
}

impl RestartSummary {
    /// Whether no group matched at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restarted.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Cycles component groups through zero replicas.
pub struct RestartOrchestrator {
    cluster: Arc<dyn ClusterApi>,
    label_key: String,
    grace: Duration,
    policy: ReplicaPolicy,
    /// Held for a whole pass. A pass that listed a group while another had
    /// it at zero would read 0 and restore the wrong count.
    pass_lock: Mutex<()>,
}

impl RestartOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        label_key: impl Into<String>,
        grace: Duration,
        policy: ReplicaPolicy,
    ) -> Self {
        Self {
            cluster,
            label_key: label_key.into(),
            grace,
            policy,
            pass_lock: Mutex::new(()),
        }
    }

    /// Create an orchestrator from configuration.
    pub fn from_config(
        cluster: Arc<dyn ClusterApi>,
        cluster_config: &ClusterConfig,
        restart_config: &RestartConfig,
    ) -> Self {
        Self::new(
            cluster,
            cluster_config.label_key.clone(),
            Duration::from_secs(restart_config.grace_period_secs),
            restart_config.replica_policy,
        )
    }

    /// Restart every group labelled with one of `labels` in `namespace`.
    ///
    /// Labels are visited in order, skipping repeats, and within a label
    /// stateful sets come before deployments. Individual failures are logged
    /// and the pass moves on. The pass fails only when something was
    /// attempted and nothing succeeded.
    ///
    /// Concurrent calls queue behind each other, whether they come from
    /// background tasks or inline requests.
    pub async fn restart_component_groups(
        &self,
        namespace: &str,
        labels: &[String],
    ) -> ControlResult<RestartSummary> {
        let _pass = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(namespace = %namespace, "waiting for running restart pass");
                self.pass_lock.lock().await
            }
        };

        let mut summary = RestartSummary::default();
        let mut seen = HashSet::new();
        let mut listings_attempted = 0usize;
        let mut listings_failed = 0usize;

        for label in labels {
            if !seen.insert(label.as_str()) {
                continue;
            }
            let selector = format!("{}={label}", self.label_key);

            for kind in GroupKind::ALL {
                listings_attempted += 1;
                let groups = match self.cluster.list_groups(kind, namespace, &selector).await {
                    Ok(groups) => groups,
                    Err(e) => {
                        listings_failed += 1;
                        error!(
                            namespace = %namespace,
                            kind = %kind,
                            selector = %selector,
                            error = %e,
                            "failed to list component groups"
                        );
                        continue;
                    }
                };

                for group in groups {
                    self.cycle_group(namespace, &group, &mut summary).await;
                }
            }
        }

        let all_listings_failed = listings_attempted > 0 && listings_failed == listings_attempted;
        let all_groups_failed = !summary.failed.is_empty() && summary.restarted.is_empty();

        if all_listings_failed || all_groups_failed {
            let message = if all_groups_failed {
                format!(
                    "all {} attempted component groups failed to restart",
                    summary.failed.len()
                )
            } else {
                "could not list any component groups".to_owned()
            };
            error!(namespace = %namespace, failed = ?summary.failed, "{message}");
            return Err(ControlError::RestartFailed(message));
        }

        info!(
            namespace = %namespace,
            restarted = summary.restarted.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "restart pass finished"
        );
        Ok(summary)
    }

    /// Replica count to restore, or `None` when the group should be left alone.
    fn restore_target(&self, replicas: Option<i32>) -> Option<i32> {
        match (replicas, self.policy) {
            (None, _) => Some(1),
            (Some(n), ReplicaPolicy::RestoreOne) if n <= 0 => Some(1),
            (Some(n), ReplicaPolicy::Preserve) if n <= 0 => None,
            (Some(n), _) => Some(n),
        }
    }

    async fn cycle_group(
        &self,
        namespace: &str,
        group: &ComponentGroup,
        summary: &mut RestartSummary,
    ) {
        let qualified = group.qualified_name();

        let Some(target) = self.restore_target(group.replicas) else {
            debug!(group = %qualified, "group has zero replicas, skipping");
            summary.skipped.push(qualified);
            return;
        };

        match self.scale_cycle(namespace, group, target).await {
            Ok(()) => {
                info!(group = %qualified, replicas = target, "restarted component group");
                summary.restarted.push(qualified);
            }
            Err(e) => {
                warn!(group = %qualified, error = %e, "component group restart failed");
                summary.failed.push(qualified);
            }
        }
    }

    async fn scale_cycle(
        &self,
        namespace: &str,
        group: &ComponentGroup,
        target: i32,
    ) -> ControlResult<()> {
        info!(group = %group.qualified_name(), "scaling component group to 0");
        self.cluster
            .scale_group(group.kind, &group.name, namespace, 0)
            .await?;

        tokio::time::sleep(self.grace).await;

        info!(
            group = %group.qualified_name(),
            replicas = target,
            "restoring component group"
        );
        self.cluster
            .scale_group(group.kind, &group.name, namespace, target)
            .await
            .inspect_err(|e| {
                error!(
                    group = %group.qualified_name(),
                    error = %e,
                    "component group left at 0 replicas"
                );
            })
    }
}

impl std::fmt::Debug for RestartOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartOrchestrator")
            .field("label_key", &self.label_key)
            .field("grace", &self.grace)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

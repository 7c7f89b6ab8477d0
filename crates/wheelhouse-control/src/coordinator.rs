//! Token-guarded manifest mutations.
//!
//! Every mutating operation follows the same sequence:
//! 1. Consume the caller's operation token
//! 2. Validate the package strings
//! 3. Read, edit and conditionally write back the manifest
//! 4. Restart the component groups so the new dependency set is installed

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ConfigDocument};
use crate::config::{ControlConfig, RestartMode};
use crate::error::{ControlError, ControlResult};
use crate::manifest::{DependencyManifest, ManifestEdit};
use crate::requirement::Requirement;
use crate::restart::{RestartId, RestartOrchestrator, RestartSummary, RestartTracker};
use crate::tokens::{IssuedToken, Operation, TokenStore};

/// Read-modify-write attempts before giving up on a contended manifest.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Where the manifest lives and what to restart after changing it.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Namespace of the config object and component groups.
    pub namespace: String,
    /// Config object name.
    pub config_map: String,
    /// Data key holding the manifest text.
    pub requirements_key: String,
    /// Component labels restarted after a change.
    pub component_roles: Vec<String>,
    /// Whether restarts run inline or in the background.
    pub restart_mode: RestartMode,
}

impl CoordinatorSettings {
    /// Extract settings from the service configuration.
    #[must_use]
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            namespace: config.cluster.namespace.clone(),
            config_map: config.cluster.config_map.clone(),
            requirements_key: config.cluster.requirements_key.clone(),
            component_roles: config.cluster.component_roles.clone(),
            restart_mode: config.restart.mode,
        }
    }
}

/// How the restart following a mutation was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartHandle {
    /// Execution mode used.
    pub mode: RestartMode,
    /// Tracker id for background passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RestartId>,
    /// Outcome of an inline pass that succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RestartSummary>,
}

/// Result of a successful mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Human-readable confirmation.
    pub message: String,
    /// Restart dispatched after the write.
    pub restart: RestartHandle,
}

/// Binds validated tokens to manifest edits and restarts.
pub struct OperationCoordinator {
    tokens: Arc<dyn TokenStore>,
    cluster: Arc<dyn ClusterApi>,
    orchestrator: Arc<RestartOrchestrator>,
    tracker: Arc<RestartTracker>,
    settings: CoordinatorSettings,
}

impl OperationCoordinator {
    /// Create a new coordinator.
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        cluster: Arc<dyn ClusterApi>,
        orchestrator: Arc<RestartOrchestrator>,
        tracker: Arc<RestartTracker>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            tokens,
            cluster,
            orchestrator,
            tracker,
            settings,
        }
    }

    /// Restart tracker shared with background passes.
    #[must_use]
    pub fn tracker(&self) -> &Arc<RestartTracker> {
        &self.tracker
    }

    /// Issue a token for a future mutation of `target`.
    pub async fn generate_token(
        &self,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<IssuedToken> {
        Requirement::parse(target)?;
        self.tokens.issue(operation, target, owner).await
    }

    /// Current manifest entries.
    pub async fn list(&self) -> ControlResult<Vec<String>> {
        let document = self.read_document().await?;
        Ok(self.manifest_of(&document).into_entries())
    }

    /// Add a requirement.
    pub async fn add(
        &self,
        package: &str,
        token: &str,
        owner: &str,
    ) -> ControlResult<MutationOutcome> {
        self.authorize(token, Operation::Add, package, owner).await?;
        let requirement = Requirement::parse(package)?;

        self.write_edit(&ManifestEdit::Add(requirement)).await?;
        audit(owner, Operation::Add, package);

        Ok(MutationOutcome {
            message: format!("Package {package} added successfully"),
            restart: self.trigger_restart().await,
        })
    }

    /// Remove a requirement.
    pub async fn remove(
        &self,
        package: &str,
        token: &str,
        owner: &str,
    ) -> ControlResult<MutationOutcome> {
        self.authorize(token, Operation::Remove, package, owner)
            .await?;
        let requirement = Requirement::parse(package)?;

        self.write_edit(&ManifestEdit::Remove(requirement)).await?;
        audit(owner, Operation::Remove, package);

        Ok(MutationOutcome {
            message: format!("Package {package} removed successfully"),
            restart: self.trigger_restart().await,
        })
    }

    /// Replace `old_package` with `new_package`.
    ///
    /// The token must be bound to `old_package`.
    pub async fn update(
        &self,
        old_package: &str,
        new_package: &str,
        token: &str,
        owner: &str,
    ) -> ControlResult<MutationOutcome> {
        self.authorize(token, Operation::Update, old_package, owner)
            .await?;
        let old = Requirement::parse(old_package)?;
        let new = Requirement::parse(new_package)?;

        self.write_edit(&ManifestEdit::Update { old, new }).await?;
        audit(owner, Operation::Update, &format!("{old_package} -> {new_package}"));

        Ok(MutationOutcome {
            message: format!("Package {old_package} updated to {new_package}"),
            restart: self.trigger_restart().await,
        })
    }

    async fn authorize(
        &self,
        token: &str,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<()> {
        if self
            .tokens
            .validate_and_consume(token, operation, target, owner)
            .await?
        {
            Ok(())
        } else {
            Err(ControlError::Unauthorized)
        }
    }

    async fn read_document(&self) -> ControlResult<ConfigDocument> {
        self.cluster
            .read_config(&self.settings.config_map, &self.settings.namespace)
            .await
    }

    fn manifest_of(&self, document: &ConfigDocument) -> DependencyManifest {
        document
            .data
            .get(&self.settings.requirements_key)
            .map(String::as_str)
            .map(DependencyManifest::parse)
            .unwrap_or_default()
    }

    /// Apply an edit with a conditional write, retrying on concurrent changes.
    ///
    /// Preconditions are re-checked against the fresh manifest on every attempt.
    async fn write_edit(&self, edit: &ManifestEdit) -> ControlResult<()> {
        let mut attempt = 1;
        loop {
            let mut document = self.read_document().await?;
            let mut manifest = self.manifest_of(&document);
            manifest.apply(edit)?;
            document
                .data
                .insert(self.settings.requirements_key.clone(), manifest.render());

            match self
                .cluster
                .write_config(
                    &self.settings.config_map,
                    &self.settings.namespace,
                    &document,
                )
                .await
            {
                Ok(()) => {
                    debug!(attempt, entries = manifest.entries().len(), "manifest written");
                    return Ok(());
                }
                Err(ControlError::ManifestConflict(name)) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(config_map = %name, attempt, "manifest changed concurrently, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the restart pass. Failures are logged and never fail the mutation.
    async fn trigger_restart(&self) -> RestartHandle {
        let namespace = self.settings.namespace.clone();
        let roles = self.settings.component_roles.clone();

        match self.settings.restart_mode {
            RestartMode::Inline => {
                let summary = match self
                    .orchestrator
                    .restart_component_groups(&namespace, &roles)
                    .await
                {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        error!(namespace = %namespace, error = %e, "restart after manifest change failed");
                        None
                    }
                };
                RestartHandle {
                    mode: RestartMode::Inline,
                    id: None,
                    summary,
                }
            }
            RestartMode::Background => {
                let id = self.tracker.register().await;
                let orchestrator = Arc::clone(&self.orchestrator);
                let tracker = Arc::clone(&self.tracker);
                let task_id = id.clone();

                tokio::spawn(async move {
                    tracker.mark_running(&task_id).await;
                    let outcome = orchestrator
                        .restart_component_groups(&namespace, &roles)
                        .await;
                    if let Err(e) = &outcome {
                        error!(restart_id = %task_id, error = %e, "background restart failed");
                    }
                    tracker.finish(&task_id, &outcome).await;
                });

                info!(restart_id = %id, "restart scheduled");
                RestartHandle {
                    mode: RestartMode::Background,
                    id: Some(id),
                    summary: None,
                }
            }
        }
    }
}

impl std::fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn audit(owner: &str, operation: Operation, package: &str) {
    warn!(user = %owner, operation = %operation, package = %package, "package manifest changed");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::cluster::{GroupKind, MemoryCluster};
    use crate::config::ReplicaPolicy;
    use crate::restart::RestartStatus;
    use crate::tokens::MemoryTokenStore;

    const NS: &str = "airflow";
    const CM: &str = "airflow-config-pypi";
    const KEY: &str = "requirements.txt";
    const USER: &str = "alice";

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        coordinator: OperationCoordinator,
    }

    fn fixture(manifest: &str, mode: RestartMode) -> Fixture {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_config(
            NS,
            CM,
            BTreeMap::from([(KEY.to_owned(), manifest.to_owned())]),
        );
        cluster.add_group(
            GroupKind::StatefulSet,
            NS,
            "airflow-worker",
            &[("component", "worker")],
            Some(2),
        );

        let dyn_cluster: Arc<dyn ClusterApi> = cluster.clone();
        let orchestrator = Arc::new(RestartOrchestrator::new(
            Arc::clone(&dyn_cluster),
            "component",
            Duration::ZERO,
            ReplicaPolicy::RestoreOne,
        ));
        let coordinator = OperationCoordinator::new(
            Arc::new(MemoryTokenStore::new(Duration::from_secs(3600))),
            dyn_cluster,
            orchestrator,
            Arc::new(RestartTracker::default()),
            CoordinatorSettings {
                namespace: NS.to_owned(),
                config_map: CM.to_owned(),
                requirements_key: KEY.to_owned(),
                component_roles: vec!["worker".to_owned(), "scheduler".to_owned()],
                restart_mode: mode,
            },
        );

        Fixture {
            cluster,
            coordinator,
        }
    }

    impl Fixture {
        async fn token(&self, operation: Operation, target: &str) -> String {
            self.coordinator
                .generate_token(operation, target, USER)
                .await
                .unwrap()
                .token
        }

        fn manifest(&self) -> String {
            self.cluster.config_data(NS, CM).unwrap()[KEY].clone()
        }
    }

    #[tokio::test]
    async fn add_appends_and_restarts() {
        let fx = fixture("", RestartMode::Inline);
        let token = fx.token(Operation::Add, "pkg==1.0").await;

        let outcome = fx.coordinator.add("pkg==1.0", &token, USER).await.unwrap();
        assert_eq!(fx.manifest(), "pkg==1.0");
        assert_eq!(outcome.restart.mode, RestartMode::Inline);
        assert_eq!(
            outcome.restart.summary.unwrap().restarted,
            ["statefulset/airflow-worker"]
        );
        assert_eq!(fx.cluster.scale_log().len(), 2);

        let token = fx.token(Operation::Add, "pkg==1.0").await;
        let err = fx.coordinator.add("pkg==1.0", &token, USER).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
        assert_eq!(fx.cluster.scale_log().len(), 2);
    }

    #[tokio::test]
    async fn remove_then_remove_again() {
        let fx = fixture("pkg==1.0\nother", RestartMode::Inline);

        let token = fx.token(Operation::Remove, "pkg==1.0").await;
        fx.coordinator.remove("pkg==1.0", &token, USER).await.unwrap();
        assert_eq!(fx.manifest(), "other");

        let token = fx.token(Operation::Remove, "pkg==1.0").await;
        let err = fx
            .coordinator
            .remove("pkg==1.0", &token, USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::PackageNotFound(_)));
    }

    #[tokio::test]
    async fn update_replaces_in_place() {
        let fx = fixture("pkg==1.0\nx", RestartMode::Inline);

        let token = fx.token(Operation::Update, "pkg==1.0").await;
        fx.coordinator
            .update("pkg==1.0", "pkg==2.0", &token, USER)
            .await
            .unwrap();
        assert_eq!(fx.manifest(), "pkg==2.0\nx");

        let token = fx.token(Operation::Update, "pkg==2.0").await;
        let err = fx
            .coordinator
            .update("pkg==2.0", "other==2.0", &token, USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
        assert_eq!(fx.manifest(), "pkg==2.0\nx");
    }

    #[tokio::test]
    async fn invalid_token_changes_nothing() {
        let fx = fixture("", RestartMode::Inline);

        let err = fx
            .coordinator
            .add("pkg==1.0", "bogus", USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized));

        // Token bound to another caller
        let token = fx.token(Operation::Add, "pkg==1.0").await;
        let err = fx
            .coordinator
            .add("pkg==1.0", &token, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized));

        assert_eq!(fx.manifest(), "");
        assert!(fx.cluster.scale_log().is_empty());
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let fx = fixture("", RestartMode::Inline);
        let token = fx.token(Operation::Add, "pkg").await;

        fx.coordinator.add("pkg", &token, USER).await.unwrap();

        // A replay is rejected before the duplicate check runs
        let err = fx.coordinator.add("pkg", &token, USER).await.unwrap_err();
        assert!(matches!(err, ControlError::Unauthorized));
        assert_eq!(fx.manifest(), "pkg");
    }

    #[tokio::test]
    async fn malformed_package_rejected() {
        let fx = fixture("", RestartMode::Inline);
        let err = fx
            .coordinator
            .generate_token(Operation::Add, "bad pkg", USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));

        let token = fx.token(Operation::Update, "pkg").await;
        let err = fx
            .coordinator
            .update("pkg", "pkg ==2", &token, USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn no_token_for_nameless_requirement() {
        let fx = fixture("", RestartMode::Inline);
        let err = fx
            .coordinator
            .generate_token(Operation::Add, "==1.0", USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn update_cannot_respell_name() {
        let fx = fixture("Foo_Bar==1.0\nx", RestartMode::Inline);

        let token = fx.token(Operation::Update, "Foo_Bar==1.0").await;
        let err = fx
            .coordinator
            .update("Foo_Bar==1.0", "foo-bar==2.0", &token, USER)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidInput(_)));
        assert_eq!(fx.manifest(), "Foo_Bar==1.0\nx");
        assert!(fx.cluster.scale_log().is_empty());
    }

    #[tokio::test]
    async fn retries_concurrent_writes() {
        let fx = fixture("", RestartMode::Inline);
        fx.cluster.inject_write_conflicts(2);

        let token = fx.token(Operation::Add, "pkg").await;
        fx.coordinator.add("pkg", &token, USER).await.unwrap();
        assert_eq!(fx.manifest(), "pkg");
    }

    #[tokio::test]
    async fn gives_up_after_repeated_conflicts() {
        let fx = fixture("", RestartMode::Inline);
        fx.cluster.inject_write_conflicts(MAX_WRITE_ATTEMPTS);

        let token = fx.token(Operation::Add, "pkg").await;
        let err = fx.coordinator.add("pkg", &token, USER).await.unwrap_err();
        assert!(matches!(err, ControlError::ManifestConflict(_)));
        assert_eq!(fx.manifest(), "");
        assert!(fx.cluster.scale_log().is_empty());
    }

    #[tokio::test]
    async fn restart_failure_does_not_fail_mutation() {
        let fx = fixture("", RestartMode::Inline);
        fx.cluster.fail_scaling("airflow-worker");

        let token = fx.token(Operation::Add, "pkg").await;
        let outcome = fx.coordinator.add("pkg", &token, USER).await.unwrap();
        assert_eq!(fx.manifest(), "pkg");
        assert!(outcome.restart.summary.is_none());
    }

    #[tokio::test]
    async fn background_restart_is_tracked() {
        let fx = fixture("", RestartMode::Background);
        let token = fx.token(Operation::Add, "pkg").await;

        let outcome = fx.coordinator.add("pkg", &token, USER).await.unwrap();
        let id = outcome.restart.id.unwrap();

        let mut status = None;
        for _ in 0..100 {
            let record = fx.coordinator.tracker().get(&id).await.unwrap();
            if record.status.is_terminal() {
                status = Some(record.status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match status {
            Some(RestartStatus::Completed { summary }) => {
                assert_eq!(summary.restarted, ["statefulset/airflow-worker"]);
            }
            other => panic!("unexpected restart status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn back_to_back_background_restarts_restore_replicas() {
        let fx = fixture("", RestartMode::Background);

        let mut ids = Vec::new();
        for package in ["a", "b"] {
            let token = fx.token(Operation::Add, package).await;
            let outcome = fx.coordinator.add(package, &token, USER).await.unwrap();
            ids.push(outcome.restart.id.unwrap());
        }

        for id in &ids {
            for _ in 0..100 {
                if fx.coordinator.tracker().get(id).await.unwrap().status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let replicas: Vec<i32> = fx.cluster.scale_log().iter().map(|e| e.replicas).collect();
        assert_eq!(replicas, [0, 2, 0, 2]);
        assert_eq!(
            fx.cluster.replicas(GroupKind::StatefulSet, NS, "airflow-worker"),
            Some(2)
        );
    }

    #[tokio::test]
    async fn list_reads_manifest() {
        let fx = fixture("a==1\n\n  b>=2  \n", RestartMode::Inline);
        assert_eq!(fx.coordinator.list().await.unwrap(), ["a==1", "b>=2"]);
    }
}

//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use wheelhouse_control::api::{router, AppState};
use wheelhouse_control::config::{AuthConfig, ReplicaPolicy, RestartMode};
use wheelhouse_control::{
    ClusterApi, CoordinatorSettings, GroupKind, MemoryCluster, MemoryTokenStore,
    OperationCoordinator, RestartOrchestrator, RestartTracker,
};

pub const NAMESPACE: &str = "data-orchestration";
pub const CONFIG_MAP: &str = "airflow-config-pypi";
pub const REQUIREMENTS_KEY: &str = "requirements.txt";
pub const BASE: &str = "/package-manager";

/// Control plane wired against an in-memory cluster.
pub struct TestControl {
    pub cluster: Arc<MemoryCluster>,
    pub tokens: Arc<MemoryTokenStore>,
    pub app: Router,
}

impl TestControl {
    /// Inline restarts with no grace period.
    pub fn new(manifest: &str) -> Self {
        Self::with_mode(manifest, RestartMode::Inline)
    }

    pub fn with_mode(manifest: &str, mode: RestartMode) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_config(
            NAMESPACE,
            CONFIG_MAP,
            BTreeMap::from([(REQUIREMENTS_KEY.to_owned(), manifest.to_owned())]),
        );
        cluster.add_group(
            GroupKind::StatefulSet,
            NAMESPACE,
            "airflow-worker",
            &[("component", "worker")],
            Some(3),
        );
        cluster.add_group(
            GroupKind::StatefulSet,
            NAMESPACE,
            "airflow-triggerer",
            &[("component", "triggerer")],
            Some(1),
        );
        cluster.add_group(
            GroupKind::Deployment,
            NAMESPACE,
            "airflow-scheduler",
            &[("component", "scheduler")],
            Some(2),
        );

        let tokens = Arc::new(MemoryTokenStore::new(Duration::from_secs(3600)));
        let dyn_cluster: Arc<dyn ClusterApi> = cluster.clone();
        let orchestrator = Arc::new(RestartOrchestrator::new(
            Arc::clone(&dyn_cluster),
            "component",
            Duration::ZERO,
            ReplicaPolicy::RestoreOne,
        ));
        let coordinator = Arc::new(OperationCoordinator::new(
            tokens.clone(),
            dyn_cluster,
            orchestrator,
            Arc::new(RestartTracker::default()),
            CoordinatorSettings {
                namespace: NAMESPACE.to_owned(),
                config_map: CONFIG_MAP.to_owned(),
                requirements_key: REQUIREMENTS_KEY.to_owned(),
                component_roles: vec![
                    "worker".to_owned(),
                    "triggerer".to_owned(),
                    "scheduler".to_owned(),
                ],
                restart_mode: mode,
            },
        ));

        let app = router(
            AppState {
                coordinator,
                auth: Arc::new(AuthConfig::default()),
            },
            BASE,
        );

        Self {
            cluster,
            tokens,
            app,
        }
    }

    /// Manifest text currently stored in the cluster.
    pub fn manifest(&self) -> String {
        self.cluster
            .config_data(NAMESPACE, CONFIG_MAP)
            .and_then(|data| data.get(REQUIREMENTS_KEY).cloned())
            .unwrap_or_default()
    }

    /// Send a request as `user` holding both capabilities.
    pub async fn call(
        &self,
        method: &str,
        path: &str,
        user: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.call_with(method, path, Some(user), "read,edit", body).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        path: &str,
        user: Option<&str>,
        capabilities: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{BASE}{path}"))
            .header("x-remote-capabilities", capabilities);
        if let Some(user) = user {
            builder = builder.header("x-remote-user", user);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        read_json(response).await
    }

    /// Request a token and return its id.
    pub async fn token(&self, operation: &str, package: &str, user: &str) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/generate_token",
                user,
                Some(serde_json::json!({"operation": operation, "package": package})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["token"].as_str().unwrap().to_owned()
    }
}

pub async fn read_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling, graceful shutdown
//! and the periodic token sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::cluster::create_cluster;
use crate::config::ControlConfig;
use crate::coordinator::{CoordinatorSettings, OperationCoordinator};
use crate::error::{ControlError, ControlResult};
use crate::restart::{RestartOrchestrator, RestartTracker};
use crate::tokens::{create_token_store, TokenStore};

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Token store and cluster client
/// - HTTP API server
/// - Background token sweep
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service until a shutdown signal arrives.
    ///
    /// Restart passes already running in the background are not aborted.
    pub async fn run(&self) -> ControlResult<()> {
        let tokens = create_token_store(&self.config.tokens).await?;
        info!(
            backend = self.config.tokens.backend.kind(),
            ttl_secs = self.config.tokens.ttl_secs,
            "token store configured"
        );

        let state = self.build_state(Arc::clone(&tokens))?;
        let app = api::router(state, &self.config.server.route_base);

        let sweeper = spawn_token_sweeper(
            tokens,
            Duration::from_secs(self.config.tokens.sweep_interval_secs),
            self.cancel.child_token(),
        );

        let listener = tokio::net::TcpListener::bind(self.config.server.listen_addr)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;

        info!(
            listen_addr = %self.config.server.listen_addr,
            route_base = %self.config.server.route_base,
            "control service listening"
        );

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| ControlError::Config(format!("server error: {e}")));

        self.cancel.cancel();
        if let Err(e) = sweeper.await {
            warn!(error = %e, "token sweeper task ended abnormally");
        }

        served?;
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn build_state(&self, tokens: Arc<dyn TokenStore>) -> ControlResult<api::AppState> {
        let cluster = create_cluster(&self.config.cluster)?;
        info!(
            backend = ?self.config.cluster.backend,
            namespace = %self.config.cluster.namespace,
            config_map = %self.config.cluster.config_map,
            "cluster client configured"
        );

        let orchestrator = Arc::new(RestartOrchestrator::from_config(
            Arc::clone(&cluster),
            &self.config.cluster,
            &self.config.restart,
        ));
        let tracker = Arc::new(RestartTracker::new(self.config.restart.history_limit));

        let coordinator = Arc::new(OperationCoordinator::new(
            tokens,
            cluster,
            orchestrator,
            tracker,
            CoordinatorSettings::from_config(&self.config),
        ));
        info!(
            roles = ?self.config.cluster.component_roles,
            mode = ?self.config.restart.mode,
            "operation coordinator initialised"
        );

        Ok(api::AppState {
            coordinator,
            auth: Arc::new(self.config.auth.clone()),
        })
    }
}

/// Periodically remove expired tokens until cancelled.
fn spawn_token_sweeper(
    tokens: Arc<dyn TokenStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match tokens.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "swept expired operation tokens"),
                    Err(e) => warn!(error = %e, "token sweep failed"),
                },
            }
        }
        debug!("token sweeper stopped");
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterBackend;
    use crate::tokens::{ManualClock, MemoryTokenStore, Operation, RandomTokenIds};

    #[test]
    fn service_shutdown() {
        let service = ControlService::new(ControlConfig::default());
        assert!(!service.cancel.is_cancelled());
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[test]
    fn builds_state_with_memory_cluster() {
        let mut config = ControlConfig::default();
        config.cluster.backend = ClusterBackend::Memory;
        let service = ControlService::new(config);

        let tokens: Arc<dyn TokenStore> =
            Arc::new(MemoryTokenStore::new(Duration::from_secs(3600)));
        assert!(service.build_state(tokens).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_tokens() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = Arc::new(MemoryTokenStore::with_parts(
            Duration::from_secs(60),
            clock.clone(),
            Arc::new(RandomTokenIds),
        ));
        store.issue(Operation::Add, "pkg", "alice").await.unwrap();
        clock.advance(Duration::from_secs(61));

        let cancel = CancellationToken::new();
        let handle = spawn_token_sweeper(store.clone(), Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.is_empty().unwrap());

        cancel.cancel();
        handle.await.unwrap();
    }
}

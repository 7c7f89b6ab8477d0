//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Operation token issuance
//! - Listing, adding, removing and updating packages
//! - Restart status queries
//! - Health and readiness checks

mod identity;
mod packages;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::config::AuthConfig;
use crate::coordinator::OperationCoordinator;

pub use identity::{Caller, Capability};
pub use packages::{
    GenerateTokenRequest, MutationResponse, PackageListResponse, PackageRequest,
    UpdatePackageRequest,
};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Coordinator for token-guarded manifest changes.
    pub coordinator: Arc<OperationCoordinator>,
    /// Identity header names.
    pub auth: Arc<AuthConfig>,
}

/// Creates the API router with package routes mounted under `route_base`.
pub fn router(state: AppState, route_base: &str) -> Router {
    let packages = Router::new()
        .route("/", get(packages::list_packages))
        .route("/list_packages", get(packages::list_packages))
        .route("/generate_token", post(packages::generate_token))
        .route("/add", post(packages::add_package))
        .route("/remove", post(packages::remove_package))
        .route("/update", post(packages::update_package))
        .route("/restarts/{id}", get(packages::get_restart));

    let base = route_base.trim_end_matches('/');
    let app = Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    let app = if base.is_empty() {
        app.merge(packages)
    } else if base.starts_with('/') {
        app.nest(base, packages)
    } else {
        app.nest(&format!("/{base}"), packages)
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
///
/// Ready once the manifest's config object can be read.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.coordinator.list().await {
        Ok(packages) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                packages: packages.len(),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    ready: false,
                    packages: 0,
                }),
            )
        }
    }
}

/// Health response.
#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(serde::Serialize)]
struct ReadyResponse {
    ready: bool,
    packages: usize,
}

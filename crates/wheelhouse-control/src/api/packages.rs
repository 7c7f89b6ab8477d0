//! Package management endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordinator::{MutationOutcome, RestartHandle};
use crate::error::{ControlError, ControlResult};
use crate::restart::{RestartId, RestartRecord};
use crate::tokens::{IssuedToken, Operation};

use super::identity::{Capability, Caller};
use super::AppState;

/// Request for an operation token.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerateTokenRequest {
    /// `add`, `remove` or `update`.
    pub operation: Option<String>,
    /// Package string the token will be bound to.
    pub package: Option<String>,
}

/// Request to add or remove a package.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageRequest {
    /// Requirement string.
    pub package: Option<String>,
    /// Operation token.
    pub token: Option<String>,
}

/// Request to replace one package with another.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdatePackageRequest {
    /// Requirement currently in the manifest.
    pub old_package: Option<String>,
    /// Replacement requirement.
    pub new_package: Option<String>,
    /// Operation token bound to `old_package`.
    pub token: Option<String>,
}

/// Current manifest entries.
#[derive(Debug, Serialize)]
pub struct PackageListResponse {
    /// Requirement strings in manifest order.
    pub packages: Vec<String>,
}

/// Response for a successful mutation.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    /// Always `true`.
    pub success: bool,
    /// Confirmation message.
    pub message: String,
    /// How the follow-up restart was dispatched.
    pub restart: RestartHandle,
}

impl From<MutationOutcome> for MutationResponse {
    fn from(outcome: MutationOutcome) -> Self {
        Self {
            success: true,
            message: outcome.message,
            restart: outcome.restart,
        }
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ControlResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ControlError::invalid_input(format!("Invalid request body: {}", e.body_text())))
}

fn required(field: Option<String>) -> ControlResult<String> {
    field
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ControlError::invalid_input("Missing required fields"))
}

/// Issue an operation token.
pub async fn generate_token(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<GenerateTokenRequest>, JsonRejection>,
) -> ControlResult<Json<IssuedToken>> {
    caller.require(Capability::Edit)?;
    let request = body(payload)?;

    let (operation, package) = match (request.operation, request.package) {
        (Some(operation), Some(package)) if !operation.is_empty() && !package.is_empty() => {
            (operation, package)
        }
        _ => return Err(ControlError::invalid_input("Missing required fields")),
    };
    let operation: Operation = operation.parse()?;

    let issued = state
        .coordinator
        .generate_token(operation, &package, &caller.user)
        .await?;
    Ok(Json(issued))
}

/// List the manifest entries.
pub async fn list_packages(
    State(state): State<AppState>,
    caller: Caller,
) -> ControlResult<Json<PackageListResponse>> {
    caller.require(Capability::Read)?;
    let packages = state.coordinator.list().await?;
    Ok(Json(PackageListResponse { packages }))
}

/// Add a package.
pub async fn add_package(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<PackageRequest>, JsonRejection>,
) -> ControlResult<Json<MutationResponse>> {
    caller.require(Capability::Edit)?;
    let request = body(payload)?;
    let (package, token) = (required(request.package)?, required(request.token)?);

    info!(package = %package, user = %caller.user, "add package requested");
    let outcome = state
        .coordinator
        .add(&package, &token, &caller.user)
        .await?;
    Ok(Json(outcome.into()))
}

/// Remove a package.
pub async fn remove_package(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<PackageRequest>, JsonRejection>,
) -> ControlResult<Json<MutationResponse>> {
    caller.require(Capability::Edit)?;
    let request = body(payload)?;
    let (package, token) = (required(request.package)?, required(request.token)?);

    info!(package = %package, user = %caller.user, "remove package requested");
    let outcome = state
        .coordinator
        .remove(&package, &token, &caller.user)
        .await?;
    Ok(Json(outcome.into()))
}

/// Replace a package.
pub async fn update_package(
    State(state): State<AppState>,
    caller: Caller,
    payload: Result<Json<UpdatePackageRequest>, JsonRejection>,
) -> ControlResult<Json<MutationResponse>> {
    caller.require(Capability::Edit)?;
    let request = body(payload)?;
    let old_package = required(request.old_package)?;
    let new_package = required(request.new_package)?;
    let token = required(request.token)?;

    info!(
        old_package = %old_package,
        new_package = %new_package,
        user = %caller.user,
        "update package requested"
    );
    let outcome = state
        .coordinator
        .update(&old_package, &new_package, &token, &caller.user)
        .await?;
    Ok(Json(outcome.into()))
}

/// Status of a background restart pass.
pub async fn get_restart(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ControlResult<Json<RestartRecord>> {
    caller.require(Capability::Read)?;
    state
        .coordinator
        .tracker()
        .get(&RestartId::new(id.as_str()))
        .await
        .map(Json)
        .ok_or(ControlError::RestartNotFound(id))
}

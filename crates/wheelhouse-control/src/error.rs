//! Error types for wheelhouse-control.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Malformed package string or missing request field.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Package is already present in the manifest.
    #[error("package already installed: {0}")]
    Conflict(String),

    /// No caller identity was asserted for the request.
    #[error("caller identity missing")]
    Unauthenticated,

    /// Operation token missing, expired, consumed or bound to something else.
    #[error("invalid or expired operation token")]
    Unauthorized,

    /// Caller lacks the capability required by the endpoint.
    #[error("caller lacks the {0} capability")]
    Forbidden(&'static str),

    /// Package absent from the manifest.
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// Config object absent from the cluster.
    #[error("config object not found: {namespace}/{name}")]
    ConfigNotFound {
        /// Config object name.
        name: String,
        /// Namespace it was looked up in.
        namespace: String,
    },

    /// No restart pass is tracked under this id.
    #[error("restart not found: {0}")]
    RestartNotFound(String),

    /// The config object changed between read and write.
    #[error("config object {0} was modified concurrently")]
    ManifestConflict(String),

    /// The cluster API returned an error.
    #[error("cluster API error: {0}")]
    Upstream(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Every attempted component group failed to restart.
    #[error("restart failed: {0}")]
    RestartFailed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create an invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an upstream error.
    #[must_use]
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable error kind.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::PackageNotFound(_)
            | Self::ConfigNotFound { .. }
            | Self::RestartNotFound(_) => "not_found",
            Self::ManifestConflict(_) => "manifest_conflict",
            Self::Upstream(_) | Self::Http(_) => "upstream",
            Self::RestartFailed(_) => "restart_failed",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status code for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Unauthorized | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PackageNotFound(_)
            | Self::ConfigNotFound { .. }
            | Self::RestartNotFound(_) => StatusCode::NOT_FOUND,
            Self::ManifestConflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_)
            | Self::Http(_)
            | Self::RestartFailed(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to callers.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(reason) => reason.clone(),
            Self::Conflict(_) => "Package already installed".to_owned(),
            Self::Unauthenticated => "Authentication required".to_owned(),
            Self::Unauthorized => "Invalid or expired token".to_owned(),
            Self::Forbidden(_) => "Insufficient permissions".to_owned(),
            Self::PackageNotFound(_) => "Package not found".to_owned(),
            Self::ConfigNotFound { .. } => "Package list not found".to_owned(),
            Self::RestartNotFound(_) => "Restart not found".to_owned(),
            Self::ManifestConflict(_) => {
                "Package list changed concurrently, please retry".to_owned()
            }

            // Hide internal details
            Self::Upstream(_)
            | Self::Http(_)
            | Self::RestartFailed(_)
            | Self::Config(_)
            | Self::Internal(_) => "Internal server error".to_owned(),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.error_type(), "request failed");
        } else {
            tracing::debug!(error = %self, kind = self.error_type(), "request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.public_message(),
            }),
        )
            .into_response()
    }
}

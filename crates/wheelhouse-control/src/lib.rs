//! Wheelhouse control plane
//!
//! This crate manages the Python requirements installed across the
//! components of a workflow-orchestration deployment running on a cluster.
//!
//! # Architecture
//!
//! The control plane is responsible for:
//!
//! - **Operation tokens**: single-use tokens bound to an operation, a
//!   package and the requesting user guard every manifest change against
//!   replay and cross-session misuse
//! - **Manifest edits**: the requirements manifest lives in a cluster config
//!   object and is rewritten as a whole with conditional writes
//! - **Rolling restarts**: after a change, each component group is scaled to
//!   zero and back so its pods reinstall the dependency set
//! - **API surface**: HTTP endpoints for operators behind an authenticating
//!   proxy
//!
//! # Mutation flow
//!
//! ```text
//! generate_token ──▶ add / remove / update ──▶ write manifest ──▶ restart groups
//!                          │
//!                          ▼
//!                 token consumed exactly once
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod api;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod requirement;
pub mod restart;
pub mod service;
pub mod tokens;

// Re-export commonly used types at the crate root
pub use cluster::{ClusterApi, ComponentGroup, ConfigDocument, GroupKind, MemoryCluster};
pub use config::ControlConfig;
pub use coordinator::{CoordinatorSettings, MutationOutcome, OperationCoordinator};
pub use error::{ControlError, ControlResult};
pub use manifest::DependencyManifest;
pub use requirement::Requirement;
pub use restart::{RestartOrchestrator, RestartStatus, RestartSummary, RestartTracker};
pub use service::ControlService;
pub use tokens::{MemoryTokenStore, Operation, TokenStore};

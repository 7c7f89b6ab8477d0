//! Configuration for wheelhouse-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Environment variable the platform uses to advertise its namespace.
const NAMESPACE_ENV: &str = "AIRFLOW__KUBERNETES_ENVIRONMENT_VARIABLES__AIRFLOW_NAMESPACE";

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cluster collaborator configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Operation token configuration.
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Restart behaviour configuration.
    #[serde(default)]
    pub restart: RestartConfig,

    /// Identity header configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `wheelhouse.toml` in the current directory (if present)
    /// 3. Environment variables with `WHEELHOUSE_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("wheelhouse.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WHEELHOUSE_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path prefix for the package manager routes.
    #[serde(default = "default_route_base")]
    pub route_base: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8090)
}

fn default_route_base() -> String {
    "/package-manager".to_owned()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            route_base: default_route_base(),
        }
    }
}

/// Which cluster collaborator to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    /// Kubernetes API server.
    #[default]
    Kubernetes,

    /// In-memory cluster for local development and tests.
    Memory,
}

/// Cluster collaborator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Backend implementation.
    #[serde(default)]
    pub backend: ClusterBackend,

    /// Namespace holding the config object and component groups.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the config object holding the manifest.
    #[serde(default = "default_config_map")]
    pub config_map: String,

    /// Key within the config object's data holding the manifest text.
    #[serde(default = "default_requirements_key")]
    pub requirements_key: String,

    /// Component roles to restart after a manifest change.
    #[serde(default = "default_component_roles")]
    pub component_roles: Vec<String>,

    /// Label key whose value identifies a component role.
    #[serde(default = "default_label_key")]
    pub label_key: String,

    /// Base URL of the cluster API server.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Path to the service account bearer token.
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,

    /// Path to the API server CA bundle.
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    /// Request timeout in seconds.
    #[serde(default = "default_cluster_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_namespace() -> String {
    std::env::var(NAMESPACE_ENV).unwrap_or_else(|_| "data-orchestration".to_owned())
}

fn default_config_map() -> String {
    "airflow-config-pypi".to_owned()
}

fn default_requirements_key() -> String {
    "requirements.txt".to_owned()
}

fn default_component_roles() -> Vec<String> {
    vec![
        "worker".to_owned(),
        "triggerer".to_owned(),
        "scheduler".to_owned(),
    ]
}

fn default_label_key() -> String {
    "component".to_owned()
}

fn default_api_url() -> String {
    "https://kubernetes.default.svc".to_owned()
}

fn default_token_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt")
}

const fn default_cluster_timeout_secs() -> u64 {
    30
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::default(),
            namespace: default_namespace(),
            config_map: default_config_map(),
            requirements_key: default_requirements_key(),
            component_roles: default_component_roles(),
            label_key: default_label_key(),
            api_url: default_api_url(),
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            timeout_secs: default_cluster_timeout_secs(),
        }
    }
}

/// Token storage backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenBackend {
    /// Process-local store.
    #[default]
    Memory,

    /// Shared Valkey/Redis store.
    Valkey {
        /// Connection URL.
        url: String,
        /// Key namespace.
        #[serde(default)]
        namespace: Option<String>,
        /// Connection pool size.
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

impl TokenBackend {
    /// Backend name for logs; never includes connection details.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Valkey { .. } => "valkey",
        }
    }
}

const fn default_pool_size() -> usize {
    10
}

/// Operation token configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Token lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How often to sweep expired tokens (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Storage backend.
    #[serde(default)]
    pub backend: TokenBackend,
}

const fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            backend: TokenBackend::default(),
        }
    }
}

/// Where the restart pass runs relative to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Spawn the pass and report progress through the restart tracker.
    #[default]
    Background,

    /// Await the whole pass before responding.
    Inline,
}

/// What to restore when a group's desired replica count is unset or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    /// Restore unset and zero counts to one replica.
    #[default]
    RestoreOne,

    /// Restore unset counts to one replica and leave zero-replica groups alone.
    Preserve,
}

/// Restart behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    /// Seconds to wait at zero replicas before restoring.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Execution mode.
    #[serde(default)]
    pub mode: RestartMode,

    /// Restore policy for unset or zero replica counts.
    #[serde(default)]
    pub replica_policy: ReplicaPolicy,

    /// Finished restarts kept for status queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

const fn default_grace_period_secs() -> u64 {
    5
}

const fn default_history_limit() -> usize {
    256
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            mode: RestartMode::default(),
            replica_policy: ReplicaPolicy::default(),
            history_limit: default_history_limit(),
        }
    }
}

/// Headers carrying the identity asserted by the fronting proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Header holding the caller identity.
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Header holding comma-separated capabilities.
    #[serde(default = "default_capabilities_header")]
    pub capabilities_header: String,
}

fn default_user_header() -> String {
    "x-remote-user".to_owned()
}

fn default_capabilities_header() -> String {
    "x-remote-capabilities".to_owned()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
            capabilities_header: default_capabilities_header(),
        }
    }
}

//! Single-use operation tokens.
//!
//! A caller first asks for a token bound to an `(operation, target)` pair
//! and to its own identity, then presents that token with the mutating
//! request. A token authorises exactly one mutation: it is removed on the
//! first successful validation and expires after a fixed TTL.
//!
//! Validation never fails loudly for bad input. Any mismatch, expiry or
//! unknown id simply yields `false`, so callers map token problems to a
//! single authorisation failure in one place.

mod memory;
#[cfg(feature = "valkey")]
mod valkey;

pub use memory::MemoryTokenStore;
#[cfg(feature = "valkey")]
pub use valkey::ValkeyTokenStore;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{TokenBackend, TokenConfig};
use crate::error::{ControlError, ControlResult};

/// Number of random bytes in a token id (256 bits).
const TOKEN_ID_BYTES: usize = 32;

/// A mutating action on the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Add a requirement.
    Add,
    /// Remove a requirement.
    Remove,
    /// Replace one requirement with another.
    Update,
}

impl Operation {
    /// Lowercase name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "update" => Ok(Self::Update),
            _ => Err(ControlError::invalid_input("Invalid operation")),
        }
    }
}

/// A stored operation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationToken {
    /// Opaque token id.
    pub id: String,
    /// Operation the token authorises.
    pub operation: Operation,
    /// Package string the operation applies to.
    pub target: String,
    /// Identity of the caller that requested the token.
    pub owner: String,
    /// Instant after which the token is no longer valid.
    pub expires_at: DateTime<Utc>,
}

impl OperationToken {
    /// Whether the token is bound to exactly this request.
    #[must_use]
    pub fn matches(&self, operation: Operation, target: &str, owner: &str) -> bool {
        self.operation == operation && self.target == target && self.owner == owner
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Token handed back to the caller on issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    /// Token id to present with the mutating request.
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
}

/// Storage for operation tokens.
///
/// Implementations must make `validate_and_consume` atomic per token: two
/// concurrent calls for the same id may not both return `true`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Issue a new token bound to `(operation, target, owner)`.
    async fn issue(
        &self,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<IssuedToken>;

    /// Check a presented token and consume it if it matches.
    ///
    /// Returns `Ok(false)` for unknown, mismatched or expired tokens. A
    /// mismatched attempt leaves a still-valid token in place.
    async fn validate_and_consume(
        &self,
        token_id: &str,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<bool>;

    /// Remove every expired token, returning how many were removed.
    async fn sweep_expired(&self) -> ControlResult<usize>;
}

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        if let Ok(mut now) = self.now.lock() {
            *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|e| *e.into_inner(), |now| *now)
    }
}

/// Generator of token ids.
pub trait TokenIdGenerator: Send + Sync + fmt::Debug {
    /// Produce a fresh, unguessable id.
    fn generate(&self) -> String;
}

/// Cryptographically random ids from the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokenIds;

impl TokenIdGenerator for RandomTokenIds {
    fn generate(&self) -> String {
        let mut bytes = [0u8; TOKEN_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

/// Shorten a token id for logging.
pub(crate) fn redact(token_id: &str) -> String {
    let prefix: String = token_id.chars().take(8).collect();
    format!("{prefix}...")
}

/// Create a token store from configuration.
pub async fn create_token_store(config: &TokenConfig) -> ControlResult<Arc<dyn TokenStore>> {
    let ttl = Duration::from_secs(config.ttl_secs);
    match &config.backend {
        TokenBackend::Memory => Ok(Arc::new(MemoryTokenStore::new(ttl))),
        #[cfg(feature = "valkey")]
        TokenBackend::Valkey {
            url,
            namespace,
            pool_size,
        } => {
            let store = ValkeyTokenStore::new(url, namespace.clone(), *pool_size, ttl).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "valkey"))]
        TokenBackend::Valkey { .. } => Err(ControlError::Config(
            "valkey token backend requires the `valkey` feature".to_owned(),
        )),
    }
}

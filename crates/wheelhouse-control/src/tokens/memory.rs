//! In-process token store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

use super::{
    redact, Clock, IssuedToken, Operation, OperationToken, RandomTokenIds, SystemClock,
    TokenIdGenerator, TokenStore,
};

/// Maximum attempts to draw an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 4;

/// Token store held in process memory.
///
/// Suitable when a single process serves all requests. Deployments running
/// several replicas need a shared backend instead.
#[derive(Debug)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, OperationToken>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn TokenIdGenerator>,
}

impl MemoryTokenStore {
    /// Create a store using the system clock and random ids.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_parts(ttl, Arc::new(SystemClock), Arc::new(RandomTokenIds))
    }

    /// Create a store with an explicit clock and id generator.
    #[must_use]
    pub fn with_parts(
        ttl: Duration,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn TokenIdGenerator>,
    ) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
            clock,
            ids,
        }
    }

    /// Number of tokens currently held, expired or not.
    pub fn len(&self) -> ControlResult<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether the store holds no tokens.
    pub fn is_empty(&self) -> ControlResult<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, HashMap<String, OperationToken>>> {
        self.tokens
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn sweep_locked(&self, tokens: &mut HashMap<String, OperationToken>) -> usize {
        let now = self.clock.now();
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired(now));
        before - tokens.len()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn issue(
        &self,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<IssuedToken> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ControlError::Config(format!("token ttl out of range: {e}")))?;

        let mut tokens = self.lock()?;
        self.sweep_locked(&mut tokens);

        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| self.ids.generate())
            .find(|id| !tokens.contains_key(id))
            .ok_or_else(|| ControlError::internal("could not allocate a unique token id"))?;

        let token = OperationToken {
            id: id.clone(),
            operation,
            target: target.to_owned(),
            owner: owner.to_owned(),
            expires_at: self.clock.now() + ttl,
        };
        tokens.insert(id.clone(), token);
        drop(tokens);

        info!(
            operation = %operation,
            package = %target,
            user = %owner,
            "issued operation token"
        );

        Ok(IssuedToken {
            token: id,
            expires_in: self.ttl.as_secs(),
        })
    }

    async fn validate_and_consume(
        &self,
        token_id: &str,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<bool> {
        let mut tokens = self.lock()?;
        self.sweep_locked(&mut tokens);

        let Some(token) = tokens.get(token_id) else {
            warn!(token = %redact(token_id), "operation token not found");
            return Ok(false);
        };

        if !token.matches(operation, target, owner) {
            warn!(
                token = %redact(token_id),
                operation = %operation,
                package = %target,
                "operation token does not match request"
            );
            return Ok(false);
        }

        if token.is_expired(self.clock.now()) {
            return Ok(false);
        }

        tokens.remove(token_id);
        debug!(token = %redact(token_id), operation = %operation, "operation token consumed");
        Ok(true)
    }

    async fn sweep_expired(&self) -> ControlResult<usize> {
        let mut tokens = self.lock()?;
        let removed = self.sweep_locked(&mut tokens);
        if removed > 0 {
            debug!(removed, "swept expired operation tokens");
        }
        Ok(removed)
    }
}

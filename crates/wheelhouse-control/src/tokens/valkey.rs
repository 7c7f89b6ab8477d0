//! Valkey/Redis token store shared between processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

use super::{
    redact, Clock, IssuedToken, Operation, RandomTokenIds, SystemClock, TokenIdGenerator,
    TokenStore,
};

const MAX_ID_ATTEMPTS: usize = 4;

/// Store the token hash only if the key is free, then set its TTL.
const ISSUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'operation', ARGV[1], 'target', ARGV[2], 'owner', ARGV[3], 'expires_at', ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return 1
"#;

/// Compare all bound fields and delete on match, in one server-side step.
const CONSUME_SCRIPT: &str = r#"
local v = redis.call('HMGET', KEYS[1], 'operation', 'target', 'owner', 'expires_at')
if not v[1] then
    return 0
end
if tonumber(v[4]) <= tonumber(ARGV[4]) then
    redis.call('DEL', KEYS[1])
    return 0
end
if v[1] ~= ARGV[1] or v[2] ~= ARGV[2] or v[3] ~= ARGV[3] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Token store backed by Valkey, for deployments with several replicas.
///
/// Expiry is enforced twice: the key carries a TTL so the server evicts it,
/// and the stored deadline is compared against the injected clock.
#[derive(Clone)]
pub struct ValkeyTokenStore {
    pool: Pool,
    namespace: Option<String>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn TokenIdGenerator>,
}

impl ValkeyTokenStore {
    /// Connect to Valkey and verify the connection.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
        ttl: Duration,
    ) -> ControlResult<Self> {
        Self::with_parts(
            url,
            namespace,
            pool_size,
            ttl,
            Arc::new(SystemClock),
            Arc::new(RandomTokenIds),
        )
        .await
    }

    /// Connect with an explicit clock and id generator.
    pub async fn with_parts(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn TokenIdGenerator>,
    ) -> ControlResult<Self> {
        let config = Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| ControlError::Config(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| ControlError::Config(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| ControlError::upstream(format!("valkey connection failed: {e}")))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| ControlError::upstream(format!("valkey ping failed: {e}")))?;

        info!(namespace = ?namespace, "connected to valkey token store");

        Ok(Self {
            pool,
            namespace,
            ttl,
            clock,
            ids,
        })
    }

    fn token_key(&self, token_id: &str) -> String {
        token_key(self.namespace.as_deref(), token_id)
    }

    async fn connection(&self) -> ControlResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| ControlError::upstream(format!("valkey connection failed: {e}")))
    }
}

fn token_key(namespace: Option<&str>, token_id: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:token:{token_id}"),
        None => format!("token:{token_id}"),
    }
}

#[async_trait]
impl TokenStore for ValkeyTokenStore {
    async fn issue(
        &self,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<IssuedToken> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ControlError::Config(format!("token ttl out of range: {e}")))?;
        let expires_at = (self.clock.now() + ttl).timestamp_millis();
        let ttl_secs = self.ttl.as_secs().max(1);

        let mut conn = self.connection().await?;
        let script = redis::Script::new(ISSUE_SCRIPT);

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate();
            let stored: i64 = script
                .key(self.token_key(&id))
                .arg(operation.as_str())
                .arg(target)
                .arg(owner)
                .arg(expires_at)
                .arg(ttl_secs)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| ControlError::upstream(format!("valkey issue failed: {e}")))?;

            if stored == 1 {
                info!(
                    operation = %operation,
                    package = %target,
                    user = %owner,
                    "issued operation token"
                );
                return Ok(IssuedToken {
                    token: id,
                    expires_in: self.ttl.as_secs(),
                });
            }
        }

        Err(ControlError::internal("could not allocate a unique token id"))
    }

    async fn validate_and_consume(
        &self,
        token_id: &str,
        operation: Operation,
        target: &str,
        owner: &str,
    ) -> ControlResult<bool> {
        let mut conn = self.connection().await?;
        let now = self.clock.now().timestamp_millis();

        let consumed: i64 = redis::Script::new(CONSUME_SCRIPT)
            .key(self.token_key(token_id))
            .arg(operation.as_str())
            .arg(target)
            .arg(owner)
            .arg(now)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ControlError::upstream(format!("valkey consume failed: {e}")))?;

        if consumed == 1 {
            debug!(token = %redact(token_id), operation = %operation, "operation token consumed");
            Ok(true)
        } else {
            warn!(
                token = %redact(token_id),
                operation = %operation,
                package = %target,
                "operation token rejected"
            );
            Ok(false)
        }
    }

    async fn sweep_expired(&self) -> ControlResult<usize> {
        // Keys carry a server-side TTL.
        Ok(0)
    }
}

impl std::fmt::Debug for ValkeyTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyTokenStore")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

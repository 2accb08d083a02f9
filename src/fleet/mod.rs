//! Fleet state publisher — per-invoker liveness signals in a shared store.
//!
//! Three hashes are maintained for the controller-side balancer:
//! `invokerId` (host IP → invoker id), `preLoadedAction` (invoker id →
//! comma-separated action names resident in the pre-load table) and
//! `busyPoolSize` (invoker id → decimal busy-pool size). Writes are
//! best-effort and overwrite in place; failures are logged, never propagated.
//! Matching read operations are exposed for the controller side.

use crate::config::FleetStoreConfig;
use std::sync::Arc;
use tokio::sync::Mutex;

const INVOKER_ID_HASH: &str = "invokerId";
const PRELOADED_ACTION_HASH: &str = "preLoadedAction";
const BUSY_POOL_SIZE_HASH: &str = "busyPoolSize";

/// Write-side client for the shared fleet state store
pub struct FleetStatePublisher {
    /// Lazily established connection
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
    config: FleetStoreConfig,
    invoker_id: String,
    host_ip: String,
}

impl FleetStatePublisher {
    /// Create a new publisher; no connection is made until the first write
    pub fn new(config: FleetStoreConfig, invoker_id: String, host_ip: String) -> Self {
        Self {
            connection: Arc::new(Mutex::new(None)),
            config,
            invoker_id,
            host_ip,
        }
    }

    /// Identity of this invoker
    pub fn invoker_id(&self) -> &str {
        &self.invoker_id
    }

    async fn get_connection(
        &self,
    ) -> std::result::Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let client = redis::Client::open(self.config.url().as_str())?;
        let conn = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.timeout_secs),
            client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| {
            redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection timed out",
            ))
        })??;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn hset(&self, hash: &str, field: &str, value: String) {
        if !self.config.enabled {
            return;
        }
        let result = async {
            let mut conn = self.get_connection().await?;
            redis::cmd("HSET")
                .arg(hash)
                .arg(field)
                .arg(&value)
                .query_async::<()>(&mut conn)
                .await
        }
        .await;

        if let Err(e) = result {
            // Drop the cached connection so the next write reconnects
            *self.connection.lock().await = None;
            tracing::warn!(hash, field, error = %e, "Fleet store write failed");
        }
    }

    async fn hget(&self, hash: &str, field: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let result = async {
            let mut conn = self.get_connection().await?;
            redis::cmd("HGET")
                .arg(hash)
                .arg(field)
                .query_async::<Option<String>>(&mut conn)
                .await
        }
        .await;

        match result {
            Ok(v) => v,
            Err(e) => {
                *self.connection.lock().await = None;
                tracing::warn!(hash, field, error = %e, "Fleet store read failed");
                None
            }
        }
    }

    /// Announce this invoker's identity under its host IP
    pub async fn publish_identity(&self) {
        self.hset(INVOKER_ID_HASH, &self.host_ip, self.invoker_id.clone())
            .await;
    }

    /// Publish the distinct action names currently in the pre-load table
    pub async fn publish_preloaded_actions(&self, action_names: &[String]) {
        self.hset(PRELOADED_ACTION_HASH, &self.invoker_id, action_names.join(","))
            .await;
    }

    /// Publish the current busy-pool size
    pub async fn publish_busy_pool_size(&self, size: usize) {
        self.hset(BUSY_POOL_SIZE_HASH, &self.invoker_id, size.to_string())
            .await;
    }

    /// Read the invoker id registered for a host IP
    pub async fn read_invoker_id(&self, host_ip: &str) -> Option<String> {
        self.hget(INVOKER_ID_HASH, host_ip).await
    }

    /// Read the pre-loaded action names of an invoker
    pub async fn read_preloaded_actions(&self, invoker_id: &str) -> Vec<String> {
        self.hget(PRELOADED_ACTION_HASH, invoker_id)
            .await
            .map(|s| {
                s.split(',')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read the busy-pool size of an invoker
    pub async fn read_busy_pool_size(&self, invoker_id: &str) -> Option<usize> {
        self.hget(BUSY_POOL_SIZE_HASH, invoker_id)
            .await
            .and_then(|s| s.parse().ok())
    }
}

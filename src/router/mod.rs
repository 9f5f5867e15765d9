//! Shard registry and router
//!
//! Owns the shard id → connection map, tracks per-shard capacity, picks
//! the write target and routes id-based reads. The write target is the
//! highest-ordinal shard under its capacity ceiling; growth happens by
//! registering a new, higher-ordinal volume.

pub mod config;

pub use config::{
    DEFAULT_BINDING_PREFIX, DEFAULT_CAPACITY_THRESHOLD, DEFAULT_MAX_SHARD_SIZE,
    DEFAULT_USAGE_SQL, RouterConfig, ShardBinding,
};

use crate::connection::ShardConnection;
use crate::core::{Result, ShardError};
use crate::id::IdCodec;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

struct ShardHandle {
    binding_name: String,
    ordinal: u32,
    connection: Arc<dyn ShardConnection>,
}

/// The shard currently designated to receive a write.
#[derive(Clone)]
pub struct ActiveShard {
    pub shard_id: String,
    pub connection: Arc<dyn ShardConnection>,
}

impl std::fmt::Debug for ActiveShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveShard")
            .field("shard_id", &self.shard_id)
            .finish_non_exhaustive()
    }
}

/// Cached capacity snapshot for one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardUsage {
    pub size_bytes: u64,
    pub refreshed_at: DateTime<Utc>,
}

/// Per-shard metadata exposed to monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub id: String,
    pub binding_name: String,
    pub is_active: bool,
    pub usage: Option<ShardUsage>,
}

/// Registry of shard connections with capacity-aware write routing.
pub struct ShardRouter {
    shards: BTreeMap<String, ShardHandle>,
    active_shard_id: String,
    codec: Arc<IdCodec>,
    usage: RwLock<HashMap<String, ShardUsage>>,
    max_shard_size: u64,
    capacity_threshold: f64,
    usage_sql: String,
}

impl ShardRouter {
    /// Build the registry from an explicit binding list. Binding names
    /// not following the `<prefix>VOL_<ordinal>_<short id>` convention
    /// are skipped with a warning. Every recognized shard id is
    /// registered with the codec so its identifiers decode anywhere
    /// this configuration is loaded.
    pub fn new(config: RouterConfig, codec: Arc<IdCodec>) -> Result<Self> {
        let mut shards = BTreeMap::new();
        for binding in config.bindings {
            match parse_binding_name(&binding.binding_name, &config.binding_prefix) {
                Some((shard_id, ordinal)) => {
                    codec.register_shard(&shard_id)?;
                    shards.insert(
                        shard_id,
                        ShardHandle {
                            binding_name: binding.binding_name,
                            ordinal,
                            connection: binding.connection,
                        },
                    );
                }
                None => {
                    tracing::warn!(
                        binding = %binding.binding_name,
                        "binding does not follow the volume naming convention, skipping"
                    );
                }
            }
        }

        let active_shard_id = shards
            .iter()
            .max_by_key(|(_, handle)| handle.ordinal)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                ShardError::Validation("no shard bindings matched the naming convention".into())
            })?;

        tracing::info!(
            shards = shards.len(),
            active = %active_shard_id,
            "shard router initialized"
        );

        Ok(Self {
            shards,
            active_shard_id,
            codec,
            usage: RwLock::new(HashMap::new()),
            max_shard_size: config.max_shard_size,
            capacity_threshold: config.capacity_threshold,
            usage_sql: config.usage_sql,
        })
    }

    /// Ordered map of shard id → connection.
    pub fn all_shards(&self) -> BTreeMap<String, Arc<dyn ShardConnection>> {
        self.shards
            .iter()
            .map(|(id, handle)| (id.clone(), handle.connection.clone()))
            .collect()
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    pub fn connection(&self, shard_id: &str) -> Option<Arc<dyn ShardConnection>> {
        self.shards.get(shard_id).map(|h| h.connection.clone())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn active_shard_id(&self) -> &str {
        &self.active_shard_id
    }

    pub fn codec(&self) -> &Arc<IdCodec> {
        &self.codec
    }

    /// Pick the write target: the active shard if it has headroom,
    /// otherwise the next-newest shard with spare capacity. Fails with
    /// `NoActiveShardAvailable` only when every shard is at or over the
    /// ceiling. The capacity read is a snapshot; a concurrent writer may
    /// race past the ceiling slightly, which is accepted.
    pub async fn active_shard_for_write(&self) -> Result<ActiveShard> {
        let ceiling = self.capacity_ceiling();

        let mut ordered: Vec<(&String, &ShardHandle)> = self.shards.iter().collect();
        ordered.sort_by(|a, b| b.1.ordinal.cmp(&a.1.ordinal));

        for (shard_id, handle) in ordered {
            match self.usage_for(shard_id, handle).await {
                Ok(usage) if usage.size_bytes < ceiling => {
                    return Ok(ActiveShard {
                        shard_id: shard_id.clone(),
                        connection: handle.connection.clone(),
                    });
                }
                Ok(usage) => {
                    tracing::debug!(
                        shard = %shard_id,
                        size = usage.size_bytes,
                        ceiling,
                        "shard at capacity, trying next"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        error = %err,
                        "usage probe failed, skipping shard for writes"
                    );
                }
            }
        }

        Err(ShardError::NoActiveShardAvailable)
    }

    /// Resolve the shard that owns an identifier.
    pub fn shard_for_id(&self, id: &str) -> Result<Arc<dyn ShardConnection>> {
        let decoded = self.codec.decode(id)?;
        self.connection(&decoded.shard_id)
            .ok_or(ShardError::UnknownShard(decoded.shard_id))
    }

    /// Run `query_fn` against every shard concurrently. Returns one
    /// `(shard_id, outcome)` entry per shard, in shard-id order; no
    /// merging, and one shard's failure does not block the others.
    pub async fn query_all<F, Fut, T>(&self, query_fn: F) -> Vec<(String, Result<T>)>
    where
        F: Fn(Arc<dyn ShardConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let futures = self.shards.iter().map(|(id, handle)| {
            let fut = query_fn(handle.connection.clone());
            let id = id.clone();
            async move { (id, fut.await) }
        });
        join_all(futures).await
    }

    /// Group ids by their decoded owning shard and issue one call per
    /// shard, never one per id. Fails fast on an id that decodes to an
    /// unregistered shard.
    pub async fn query_by_ids<F, Fut, T>(&self, ids: &[String], query_fn: F) -> Result<Vec<T>>
    where
        F: Fn(Arc<dyn ShardConnection>, Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in ids {
            let decoded = self.codec.decode(id)?;
            if !self.shards.contains_key(&decoded.shard_id) {
                return Err(ShardError::UnknownShard(decoded.shard_id));
            }
            grouped.entry(decoded.shard_id).or_default().push(id.clone());
        }

        let futures = grouped.into_iter().filter_map(|(shard_id, shard_ids)| {
            self.connection(&shard_id)
                .map(|conn| query_fn(conn, shard_ids))
        });

        let mut rows = Vec::new();
        for outcome in join_all(futures).await {
            rows.extend(outcome?);
        }
        Ok(rows)
    }

    /// Per-shard metadata, probing usage where no snapshot is cached.
    pub async fn shard_stats(&self) -> Vec<ShardStats> {
        let mut stats = Vec::with_capacity(self.shards.len());
        for (id, handle) in &self.shards {
            let usage = match self.usage_for(id, handle).await {
                Ok(usage) => Some(usage),
                Err(err) => {
                    tracing::warn!(shard = %id, error = %err, "usage probe failed");
                    None
                }
            };
            stats.push(ShardStats {
                id: id.clone(),
                binding_name: handle.binding_name.clone(),
                is_active: *id == self.active_shard_id,
                usage,
            });
        }
        stats
    }

    /// Force a refresh of a shard's cached usage snapshot.
    pub async fn update_shard_metadata(&self, shard_id: &str) -> Result<ShardUsage> {
        let handle = self
            .shards
            .get(shard_id)
            .ok_or_else(|| ShardError::UnknownShard(shard_id.to_string()))?;
        self.refresh_usage(shard_id, &handle.connection).await
    }

    /// Byte ceiling past which a shard stops taking writes.
    pub fn capacity_ceiling(&self) -> u64 {
        (self.max_shard_size as f64 * self.capacity_threshold) as u64
    }

    async fn usage_for(&self, shard_id: &str, handle: &ShardHandle) -> Result<ShardUsage> {
        if let Some(usage) = self.usage.read().await.get(shard_id) {
            return Ok(usage.clone());
        }
        self.refresh_usage(shard_id, &handle.connection).await
    }

    async fn refresh_usage(
        &self,
        shard_id: &str,
        connection: &Arc<dyn ShardConnection>,
    ) -> Result<ShardUsage> {
        let row = connection.first(&self.usage_sql, &[]).await?;
        let size_bytes = row
            .as_ref()
            .and_then(|r| r.get("size"))
            .and_then(value_as_u64)
            .ok_or_else(|| {
                ShardError::Execution(format!(
                    "usage probe for shard '{shard_id}' returned no size"
                ))
            })?;

        let usage = ShardUsage {
            size_bytes,
            refreshed_at: Utc::now(),
        };
        self.usage
            .write()
            .await
            .insert(shard_id.to_string(), usage.clone());
        Ok(usage)
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}

/// `DB_VOL_003_ghi789` → `("VOL_003_ghi789", 3)`.
fn parse_binding_name(name: &str, prefix: &str) -> Option<(String, u32)> {
    let logical = name.strip_prefix(prefix)?;
    let rest = logical.strip_prefix("VOL_")?;
    let (ordinal_part, short_id) = rest.split_once('_')?;
    if ordinal_part.is_empty() || short_id.is_empty() {
        return None;
    }
    let ordinal: u32 = ordinal_part.parse().ok()?;
    Some((logical.to_string(), ordinal))
}

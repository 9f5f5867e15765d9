use crate::connection::ShardConnection;
use std::sync::Arc;

/// Default per-shard size budget (10 GiB).
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Writes stop targeting a shard once it reports 90% of the budget.
pub const DEFAULT_CAPACITY_THRESHOLD: f64 = 0.9;

pub const DEFAULT_BINDING_PREFIX: &str = "DB_";

/// Size probe issued against a shard; must return one row with a
/// `size` column in bytes.
pub const DEFAULT_USAGE_SQL: &str =
    "SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()";

/// One configured shard: the binding name from the deployment
/// configuration plus its live connection.
#[derive(Clone)]
pub struct ShardBinding {
    /// e.g. `DB_VOL_003_ghi789`; the router strips the prefix to get
    /// the logical shard id `VOL_003_ghi789`.
    pub binding_name: String,
    pub connection: Arc<dyn ShardConnection>,
}

impl ShardBinding {
    pub fn new(binding_name: impl Into<String>, connection: Arc<dyn ShardConnection>) -> Self {
        Self {
            binding_name: binding_name.into(),
            connection,
        }
    }
}

/// Router configuration: an explicit, typed list of shard bindings
/// built once at startup.
#[derive(Clone)]
pub struct RouterConfig {
    pub bindings: Vec<ShardBinding>,
    pub binding_prefix: String,
    /// Size budget per shard, in bytes.
    pub max_shard_size: u64,
    /// Fraction of the budget at which a shard stops taking writes.
    pub capacity_threshold: f64,
    pub usage_sql: String,
}

impl RouterConfig {
    pub fn new(bindings: Vec<ShardBinding>) -> Self {
        Self {
            bindings,
            binding_prefix: DEFAULT_BINDING_PREFIX.to_string(),
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            capacity_threshold: DEFAULT_CAPACITY_THRESHOLD,
            usage_sql: DEFAULT_USAGE_SQL.to_string(),
        }
    }

    pub fn binding_prefix(mut self, prefix: &str) -> Self {
        self.binding_prefix = prefix.to_string();
        self
    }

    pub fn max_shard_size(mut self, bytes: u64) -> Self {
        self.max_shard_size = bytes;
        self
    }

    pub fn capacity_threshold(mut self, threshold: f64) -> Self {
        self.capacity_threshold = threshold;
        self
    }

    pub fn usage_sql(mut self, sql: &str) -> Self {
        self.usage_sql = sql.to_string();
        self
    }
}

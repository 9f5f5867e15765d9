//! Shard connection contract
//!
//! A shard is an opaque prepared-statement executor. The trait collapses
//! the `prepare(sql).bind(..).first()|.all()|.run()` + `batch(ops)`
//! surface of the underlying driver into four async calls, so the rest
//! of the crate never depends on a concrete storage engine.

use crate::core::{Params, Result, Row};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single SQL statement with positional bind parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Params,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Params) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Execution metadata for a write statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    /// Number of rows changed by the statement.
    pub changes: u64,
}

/// Minimal prepared-statement/batch contract a shard must expose.
///
/// `batch` is atomic within one shard; nothing in this crate assumes
/// atomicity across shards.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    /// Execute a query and return the first row, if any.
    async fn first(&self, sql: &str, params: &[Value]) -> Result<Option<Row>>;

    /// Execute a query and return all rows.
    async fn all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a write statement.
    async fn run(&self, sql: &str, params: &[Value]) -> Result<RunMeta>;

    /// Execute several statements as one atomic batch on this shard.
    async fn batch(&self, statements: &[Statement]) -> Result<Vec<RunMeta>>;
}

//! Best-effort distributed transaction
//!
//! Operations are grouped by shard and each group runs as one atomic
//! batch on its shard. The overall call is NOT atomic across shards: a
//! failing shard leaves the other shards' effects applied, and the
//! outcome reports one error entry per failing shard. This is a saga
//! without compensation; callers needing strict atomicity must
//! confine the logical transaction to a single shard.

use super::CrossShardQuery;
use crate::connection::{RunMeta, Statement};
use crate::core::{Params, ShardError};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;

/// One operation of a distributed transaction.
#[derive(Debug, Clone)]
pub struct ShardStatement {
    pub shard_id: String,
    pub sql: String,
    pub params: Params,
}

impl ShardStatement {
    pub fn new(shard_id: impl Into<String>, sql: impl Into<String>, params: Params) -> Self {
        Self {
            shard_id: shard_id.into(),
            sql: sql.into(),
            params,
        }
    }
}

/// Per-statement result from a shard whose batch committed.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub shard_id: String,
    pub meta: RunMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionError {
    pub shard_id: String,
    pub error: String,
}

/// The honest contract of a cross-shard write: per-shard outcomes, no
/// rollback. `success` is true only when every shard's batch committed.
#[derive(Debug, Serialize)]
pub struct TransactionResult {
    pub success: bool,
    pub results: Vec<OperationOutcome>,
    pub errors: Vec<TransactionError>,
}

impl CrossShardQuery {
    /// Group `operations` by shard and dispatch one atomic batch per
    /// shard, concurrently. Failures are reported per shard, never
    /// rolled back.
    pub async fn execute_distributed_transaction(
        &self,
        operations: Vec<ShardStatement>,
    ) -> TransactionResult {
        let mut grouped: BTreeMap<String, Vec<Statement>> = BTreeMap::new();
        for op in operations {
            grouped
                .entry(op.shard_id)
                .or_default()
                .push(Statement::new(op.sql, op.params));
        }

        let futures = grouped.into_iter().map(|(shard_id, statements)| {
            let connection = self.router().connection(&shard_id);
            async move {
                let outcome = match connection {
                    Some(conn) => conn.batch(&statements).await,
                    None => Err(ShardError::UnknownShard(shard_id.clone())),
                };
                (shard_id, outcome)
            }
        });

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (shard_id, outcome) in join_all(futures).await {
            match outcome {
                Ok(metas) => {
                    results.extend(metas.into_iter().map(|meta| OperationOutcome {
                        shard_id: shard_id.clone(),
                        meta,
                    }));
                }
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        error = %err,
                        "shard batch failed in distributed transaction, no rollback"
                    );
                    errors.push(TransactionError {
                        shard_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        TransactionResult {
            success: errors.is_empty(),
            results,
            errors,
        }
    }
}

//! Cross-shard query orchestrator
//!
//! Fans statements out to every shard and merges the results with
//! global semantics: sorting and pagination applied after the merge,
//! aggregates recombined (never averaged-of-averages), joins performed
//! in memory over the globally collected row sets, and distributed
//! writes dispatched as best-effort per-shard batches.

pub mod aggregate;
pub mod join;
pub mod sort;
pub mod stream;
pub mod transaction;

pub use aggregate::{AggregateResult, AggregateSpec, Filter};
pub use sort::{OrderBy, SortDirection};
pub use transaction::{OperationOutcome, ShardStatement, TransactionError, TransactionResult};

use crate::core::{Result, Row};
use crate::router::ShardRouter;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_MAX_JOIN_ROWS: usize = 50_000;

/// Sorting and pagination applied to the merged result set.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn order_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Merge metadata: row totals before pagination, per contributing shard.
/// Shards that failed are absent from `shard_counts`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMeta {
    pub total_count: usize,
    pub shard_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct GlobalQueryResult {
    pub results: Vec<Row>,
    pub meta: QueryMeta,
}

/// Fan-out/merge executor over a shard router.
pub struct CrossShardQuery {
    router: Arc<ShardRouter>,
    max_join_rows: usize,
}

impl CrossShardQuery {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self {
            router,
            max_join_rows: DEFAULT_MAX_JOIN_ROWS,
        }
    }

    /// Cap on the number of rows either side of an in-memory join may
    /// materialize.
    pub fn max_join_rows(mut self, limit: usize) -> Self {
        self.max_join_rows = limit;
        self
    }

    pub(crate) fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub(crate) fn join_row_ceiling(&self) -> usize {
        self.max_join_rows
    }

    /// Execute a statement on every shard, merge the rows, sort
    /// globally, then paginate. Per-shard limiting would corrupt the
    /// global ranking, so offset/limit apply strictly after the sort.
    /// A failing shard is excluded from the merge and from
    /// `shard_counts`; the call still returns the partial result.
    pub async fn query_all_shards_with_global_sort(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<GlobalQueryResult> {
        let outcomes = self
            .router
            .query_all(|conn| {
                let sql = sql.to_string();
                let params = params.to_vec();
                async move { conn.all(&sql, &params).await }
            })
            .await;

        let mut rows: Vec<Row> = Vec::new();
        let mut shard_counts = BTreeMap::new();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(shard_rows) => {
                    shard_counts.insert(shard_id, shard_rows.len());
                    rows.extend(shard_rows);
                }
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        error = %err,
                        "shard failed during fan-out query, excluding from merge"
                    );
                }
            }
        }

        let total_count = rows.len();

        if let Some(order_by) = &options.order_by {
            sort::sort_rows(&mut rows, order_by);
        }

        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        let results: Vec<Row> = rows.into_iter().skip(offset).take(limit).collect();

        Ok(GlobalQueryResult {
            results,
            meta: QueryMeta {
                total_count,
                shard_counts,
            },
        })
    }
}

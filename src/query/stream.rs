//! Lazy batch streaming from all shards
//!
//! Paginates each shard with bounded LIMIT/OFFSET pages, yielding one
//! batch at a time and moving to the next shard once a shard returns an
//! empty page. Suspension happens between yields, so the consumer
//! controls the pace. There is no global ordering guarantee, and the
//! stream is not resumable: restarting re-reads from offset zero.

use super::CrossShardQuery;
use crate::connection::ShardConnection;
use crate::core::{Params, Result, Row};
use futures::Stream;
use serde_json::Value;
use std::sync::Arc;

struct StreamState {
    shards: Vec<(String, Arc<dyn ShardConnection>)>,
    shard_index: usize,
    offset: usize,
    sql: String,
    params: Params,
    batch_size: usize,
}

impl CrossShardQuery {
    /// Produce a finite stream of row batches covering every shard.
    /// Each item is one page from the shard currently being drained; a
    /// shard error ends the stream with that error.
    pub fn stream_from_all_shards(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> impl Stream<Item = Result<Vec<Row>>> + Send + use<> {
        let state = StreamState {
            shards: self.router().all_shards().into_iter().collect(),
            shard_index: 0,
            offset: 0,
            sql: format!("{sql} LIMIT ? OFFSET ?"),
            params: params.to_vec(),
            batch_size: batch_size.max(1),
        };

        futures::stream::try_unfold(state, |mut state| async move {
            loop {
                let Some((shard_id, connection)) = state.shards.get(state.shard_index) else {
                    return Ok(None);
                };

                let mut params = state.params.clone();
                params.push(Value::from(state.batch_size as u64));
                params.push(Value::from(state.offset as u64));

                let rows = connection.all(&state.sql, &params).await?;
                if rows.is_empty() {
                    tracing::debug!(shard = %shard_id, "shard drained, moving to next");
                    state.shard_index += 1;
                    state.offset = 0;
                    continue;
                }

                state.offset += state.batch_size;
                return Ok(Some((rows, state)));
            }
        })
    }
}

//! Cross-shard uniqueness enforcement
//!
//! Logical uniqueness holds over the union of all shards' rows, never
//! per shard alone: a value present once on two different shards is
//! still a duplicate. Checks probe every shard; repair keeps one
//! occurrence by creation time and deletes the rest.

use crate::core::{Result, ShardError, compare_values};
use crate::router::ShardRouter;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One uniqueness probe: does `table.column = value` exist anywhere?
#[derive(Debug, Clone)]
pub struct UniqueCheck {
    pub table: String,
    pub column: String,
    pub value: Value,
    /// Excluded id, for update flows checking against the row itself.
    pub exclude_id: Option<String>,
}

impl UniqueCheck {
    pub fn new(table: impl Into<String>, column: impl Into<String>, value: Value) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            value,
            exclude_id: None,
        }
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude_id = Some(id.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub violations: Vec<String>,
}

/// One duplicated value with its total occurrence count and the shards
/// holding it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DuplicateEntry {
    pub value: Value,
    pub count: i64,
    pub shard_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepStrategy {
    /// Keep the oldest occurrence by creation time.
    First,
    /// Keep the newest occurrence.
    Last,
}

#[derive(Debug, Serialize)]
pub struct DedupOutcome {
    pub kept: u64,
    pub removed: u64,
}

pub struct DeduplicationService {
    router: Arc<ShardRouter>,
}

impl DeduplicationService {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self { router }
    }

    /// Probe every shard concurrently and short-circuit to `false` on
    /// the first shard reporting a match; remaining probes are dropped.
    /// Returns `true` only when no shard holds the value. A shard error
    /// surfaces immediately; uniqueness cannot be asserted without it.
    pub async fn check_unique(&self, check: &UniqueCheck) -> Result<bool> {
        let mut sql = format!(
            "SELECT id FROM {} WHERE {} = ?",
            check.table, check.column
        );
        let mut params = vec![check.value.clone()];
        if let Some(exclude_id) = &check.exclude_id {
            sql.push_str(" AND id != ?");
            params.push(Value::from(exclude_id.clone()));
        }
        sql.push_str(" LIMIT 1");

        let mut probes: FuturesUnordered<_> = self
            .router
            .all_shards()
            .into_iter()
            .map(|(shard_id, conn)| {
                let sql = sql.clone();
                let params = params.clone();
                async move { (shard_id, conn.first(&sql, &params).await) }
            })
            .collect();

        while let Some((shard_id, outcome)) = probes.next().await {
            match outcome {
                Ok(Some(_)) => {
                    tracing::debug!(shard = %shard_id, column = %check.column, "value already present");
                    return Ok(false);
                }
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Check several columns of one table, collecting a human-readable
    /// violation per column that fails.
    pub async fn validate_unique_constraints(
        &self,
        table: &str,
        fields: &[(String, Value)],
    ) -> Result<ValidationOutcome> {
        let mut violations = Vec::new();
        for (column, value) in fields {
            let check = UniqueCheck::new(table, column.clone(), value.clone());
            if !self.check_unique(&check).await? {
                violations.push(format!(
                    "{column} '{}' already exists",
                    display_value(value)
                ));
            }
        }
        Ok(ValidationOutcome {
            valid: violations.is_empty(),
            violations,
        })
    }

    /// Detect duplicated values: intra-shard (count > 1 on one shard)
    /// and cross-shard (the same value on two or more shards, even when
    /// each shard individually holds it once).
    pub async fn find_duplicates(&self, table: &str, column: &str) -> Result<Vec<DuplicateEntry>> {
        let group_sql = format!(
            "SELECT {column} AS value, COUNT(*) AS count FROM {table} \
             GROUP BY {column} HAVING COUNT(*) > 1"
        );
        let presence_sql = format!("SELECT DISTINCT {column} AS value FROM {table}");

        let outcomes = self
            .router
            .query_all(|conn| {
                let group_sql = group_sql.clone();
                let presence_sql = presence_sql.clone();
                async move {
                    let grouped = conn.all(&group_sql, &[]).await?;
                    let present = conn.all(&presence_sql, &[]).await?;
                    Ok((grouped, present))
                }
            })
            .await;

        // value key → (original value, per-shard occurrence count)
        let mut occurrences: BTreeMap<String, (Value, BTreeMap<String, i64>)> = BTreeMap::new();

        for (shard_id, outcome) in outcomes {
            let (grouped, present) = match outcome {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        error = %err,
                        "shard failed during duplicate scan, excluding"
                    );
                    continue;
                }
            };

            for row in &grouped {
                let Some(value) = row.get("value") else { continue };
                let count = row.get("count").and_then(Value::as_i64).unwrap_or(1);
                let entry = occurrences
                    .entry(value.to_string())
                    .or_insert_with(|| (value.clone(), BTreeMap::new()));
                entry.1.insert(shard_id.clone(), count);
            }

            for row in &present {
                let Some(value) = row.get("value") else { continue };
                let entry = occurrences
                    .entry(value.to_string())
                    .or_insert_with(|| (value.clone(), BTreeMap::new()));
                entry.1.entry(shard_id.clone()).or_insert(1);
            }
        }

        let mut duplicates = Vec::new();
        for (_, (value, per_shard)) in occurrences {
            let total: i64 = per_shard.values().sum();
            if total > 1 {
                duplicates.push(DuplicateEntry {
                    value,
                    count: total,
                    shard_ids: per_shard.into_keys().collect(),
                });
            }
        }
        Ok(duplicates)
    }

    /// Remove duplicate rows, keeping the oldest (`First`) or newest
    /// (`Last`) occurrence by `created_at`. Failed deletes are logged
    /// and left in place; the returned totals count only applied work.
    pub async fn deduplicate_table(
        &self,
        table: &str,
        column: &str,
        keep: KeepStrategy,
    ) -> Result<DedupOutcome> {
        let duplicates = self.find_duplicates(table, column).await?;

        let mut kept = 0u64;
        let mut removed = 0u64;

        for duplicate in duplicates {
            let holders = self.fetch_holders(table, column, &duplicate).await?;
            if holders.len() <= 1 {
                continue;
            }

            let keep_index = match keep {
                KeepStrategy::First => 0,
                KeepStrategy::Last => holders.len() - 1,
            };
            kept += 1;

            for (index, holder) in holders.iter().enumerate() {
                if index == keep_index {
                    continue;
                }
                let Some(conn) = self.router.connection(&holder.shard_id) else {
                    continue;
                };
                let delete_sql = format!("DELETE FROM {table} WHERE id = ?");
                match conn.run(&delete_sql, &[Value::from(holder.id.clone())]).await {
                    Ok(_) => removed += 1,
                    Err(err) => {
                        tracing::warn!(
                            shard = %holder.shard_id,
                            id = %holder.id,
                            error = %err,
                            "failed to delete duplicate row"
                        );
                    }
                }
            }
        }

        Ok(DedupOutcome { kept, removed })
    }

    /// All rows holding a duplicated value, across its shards, ordered
    /// globally by creation time (ties keep shard order).
    async fn fetch_holders(
        &self,
        table: &str,
        column: &str,
        duplicate: &DuplicateEntry,
    ) -> Result<Vec<HolderRow>> {
        let sql = format!(
            "SELECT id, created_at FROM {table} WHERE {column} = ? ORDER BY created_at ASC"
        );

        let mut holders = Vec::new();
        for shard_id in &duplicate.shard_ids {
            let conn = self
                .router
                .connection(shard_id)
                .ok_or_else(|| ShardError::UnknownShard(shard_id.clone()))?;
            let rows = conn.all(&sql, &[duplicate.value.clone()]).await?;
            for row in rows {
                holders.push(HolderRow {
                    shard_id: shard_id.clone(),
                    id: row
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    created_at: row.get("created_at").cloned().unwrap_or(Value::Null),
                });
            }
        }

        holders.retain(|h| !h.id.is_empty());
        holders.sort_by(|a, b| compare_values(&a.created_at, &b.created_at));
        Ok(holders)
    }
}

struct HolderRow {
    shard_id: String,
    id: String,
    created_at: Value,
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_value_unquotes_strings() {
        assert_eq!(display_value(&json!("a@b.com")), "a@b.com");
        assert_eq!(display_value(&json!(42)), "42");
    }
}

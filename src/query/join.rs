//! In-memory cross-shard join
//!
//! The matching row may live on a different shard, so both sides are
//! materialized from every shard and joined with an explicit hash join
//! (build on the right side, probe with the left). This trades
//! efficiency for correctness and suits small/medium joined sets;
//! callers with large sets should denormalize or pre-aggregate. Either
//! side exceeding the configured row ceiling fails with
//! `ResourceLimit` rather than degrading silently.

use super::CrossShardQuery;
use crate::core::{Result, Row, ShardError};
use serde_json::Value;
use std::collections::HashMap;

/// `users.user_id = orders.user_id` split into its two column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinCondition {
    pub left_column: String,
    pub right_column: String,
}

impl CrossShardQuery {
    /// Fetch both tables from every shard and hash-join the merged row
    /// sets. `where_clause` filters the left table on each shard before
    /// collection. `columns` projects the joined rows; `["*"]` keeps
    /// everything. On key collision the left row's column wins.
    pub async fn join_across_shards(
        &self,
        left_table: &str,
        right_table: &str,
        on_condition: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        where_params: &[Value],
    ) -> Result<Vec<Row>> {
        let condition = parse_condition(on_condition, left_table, right_table)?;

        let mut left_sql = format!("SELECT * FROM {left_table}");
        if let Some(clause) = where_clause {
            left_sql.push_str(&format!(" WHERE {clause}"));
        }
        let right_sql = format!("SELECT * FROM {right_table}");

        let left_rows = self.collect_side(&left_sql, where_params, left_table).await?;
        let right_rows = self.collect_side(&right_sql, &[], right_table).await?;

        let mut build: HashMap<String, Vec<&Row>> = HashMap::new();
        for row in &right_rows {
            if let Some(key) = join_key(row, &condition.right_column) {
                build.entry(key).or_default().push(row);
            }
        }

        let mut joined = Vec::new();
        for left in &left_rows {
            let Some(key) = join_key(left, &condition.left_column) else {
                continue;
            };
            let Some(matches) = build.get(&key) else {
                continue;
            };
            for right in matches {
                let mut merged = left.clone();
                for (column, value) in right.iter() {
                    merged.entry(column.clone()).or_insert_with(|| value.clone());
                }
                joined.push(project(merged, columns));
            }
        }

        Ok(joined)
    }

    async fn collect_side(&self, sql: &str, params: &[Value], table: &str) -> Result<Vec<Row>> {
        let outcomes = self
            .router()
            .query_all(|conn| {
                let sql = sql.to_string();
                let params = params.to_vec();
                async move { conn.all(&sql, &params).await }
            })
            .await;

        let ceiling = self.join_row_ceiling();
        let mut rows = Vec::new();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(shard_rows) => rows.extend(shard_rows),
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        table = %table,
                        error = %err,
                        "shard failed during join fetch, its rows will be missing"
                    );
                }
            }
            if rows.len() > ceiling {
                return Err(ShardError::ResourceLimit(format!(
                    "join side '{table}' exceeds {ceiling} rows"
                )));
            }
        }
        Ok(rows)
    }
}

fn parse_condition(
    on_condition: &str,
    left_table: &str,
    right_table: &str,
) -> Result<JoinCondition> {
    let invalid = || {
        ShardError::Validation(format!(
            "join condition '{on_condition}' must be of the form \
             {left_table}.column = {right_table}.column"
        ))
    };

    let (left, right) = on_condition.split_once('=').ok_or_else(invalid)?;
    let left_column = strip_qualifier(left.trim(), left_table).ok_or_else(invalid)?;
    let right_column = strip_qualifier(right.trim(), right_table).ok_or_else(invalid)?;

    Ok(JoinCondition {
        left_column,
        right_column,
    })
}

fn strip_qualifier(side: &str, table: &str) -> Option<String> {
    if side.is_empty() {
        return None;
    }
    match side.split_once('.') {
        Some((qualifier, column)) if qualifier == table && !column.is_empty() => {
            Some(column.to_string())
        }
        Some(_) => None,
        None => Some(side.to_string()),
    }
}

fn join_key(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.to_string()),
    }
}

fn project(row: Row, columns: &[&str]) -> Row {
    if columns.is_empty() || columns.contains(&"*") {
        return row;
    }
    row.into_iter()
        .filter(|(column, _)| columns.contains(&column.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_condition_with_qualifiers() {
        let condition = parse_condition("users.user_id = orders.user_id", "users", "orders")
            .unwrap();
        assert_eq!(condition.left_column, "user_id");
        assert_eq!(condition.right_column, "user_id");
    }

    #[test]
    fn test_parse_condition_bare_columns() {
        let condition = parse_condition("id = owner_id", "users", "orders").unwrap();
        assert_eq!(condition.left_column, "id");
        assert_eq!(condition.right_column, "owner_id");
    }

    #[test]
    fn test_parse_condition_rejects_wrong_qualifier() {
        assert!(parse_condition("tasks.id = orders.id", "users", "orders").is_err());
        assert!(parse_condition("users.id", "users", "orders").is_err());
    }

    #[test]
    fn test_null_join_keys_never_match() {
        let mut row = Row::new();
        row.insert("user_id".to_string(), json!(null));
        assert!(join_key(&row, "user_id").is_none());
        assert!(join_key(&row, "missing").is_none());
    }

    #[test]
    fn test_projection() {
        let mut row = Row::new();
        row.insert("a".to_string(), json!(1));
        row.insert("b".to_string(), json!(2));

        let all = project(row.clone(), &["*"]);
        assert_eq!(all.len(), 2);

        let only_a = project(row, &["a"]);
        assert_eq!(only_a.len(), 1);
        assert!(only_a.contains_key("a"));
    }
}

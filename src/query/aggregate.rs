//! Cross-shard aggregation
//!
//! One aggregate statement per shard, recombined globally: counts and
//! sums add, min/max take the global extreme, averages are recomputed
//! from the combined sum and count, never averaged-of-averages.
//! Grouped aggregation merges rows by group key, summing counts and
//! sums for the same key across shards.

use super::CrossShardQuery;
use crate::core::{Params, Result, Row, ShardError, as_number, compare_values};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Optional WHERE clause applied on every shard before aggregating.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub clause: String,
    pub params: Params,
}

/// Which aggregates to compute. Grouped mode (`group_by` non-empty)
/// supports per-group counts and sums; scalar mode supports all of
/// count/sum/avg/min/max.
#[derive(Debug, Clone, Default)]
pub struct AggregateSpec {
    pub count: bool,
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
    pub group_by: Vec<String>,
    pub filter: Option<Filter>,
}

impl AggregateSpec {
    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn sum(mut self, columns: &[&str]) -> Self {
        self.sum = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn avg(mut self, columns: &[&str]) -> Self {
        self.avg = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn min(mut self, columns: &[&str]) -> Self {
        self.min = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn max(mut self, columns: &[&str]) -> Self {
        self.max = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.group_by = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, clause: &str, params: Params) -> Self {
        self.filter = Some(Filter {
            clause: clause.to_string(),
            params,
        });
        self
    }

    fn is_empty(&self) -> bool {
        !self.count
            && self.sum.is_empty()
            && self.avg.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
            && self.group_by.is_empty()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct AggregateResult {
    pub count: Option<i64>,
    pub sum: BTreeMap<String, f64>,
    pub avg: BTreeMap<String, f64>,
    pub min: BTreeMap<String, Value>,
    pub max: BTreeMap<String, Value>,
    pub groups: Vec<Row>,
}

impl CrossShardQuery {
    /// Aggregate one table across every shard and recombine globally.
    /// A failing shard is excluded from the combination with a warning,
    /// like every other fan-out operation.
    pub async fn aggregate_across_shards(
        &self,
        table: &str,
        spec: &AggregateSpec,
    ) -> Result<AggregateResult> {
        let sql = build_aggregate_sql(table, spec)?;
        let params: Params = spec
            .filter
            .as_ref()
            .map(|f| f.params.clone())
            .unwrap_or_default();

        let outcomes = self
            .router()
            .query_all(|conn| {
                let sql = sql.clone();
                let params = params.clone();
                async move { conn.all(&sql, &params).await }
            })
            .await;

        let mut merger = AggregateMerger::new(spec);
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(rows) => merger.absorb(&rows),
                Err(err) => {
                    tracing::warn!(
                        shard = %shard_id,
                        error = %err,
                        "shard failed during aggregation, excluding from combination"
                    );
                }
            }
        }
        Ok(merger.finish())
    }
}

fn build_aggregate_sql(table: &str, spec: &AggregateSpec) -> Result<String> {
    if spec.is_empty() {
        return Err(ShardError::Validation(
            "aggregation spec selects nothing".into(),
        ));
    }

    let mut select: Vec<String> = Vec::new();

    if spec.group_by.is_empty() {
        if spec.count {
            select.push("COUNT(*) AS count".to_string());
        }
        for column in &spec.sum {
            select.push(format!("SUM({column}) AS sum_{column}"));
        }
        for column in &spec.avg {
            // avg is recombined from sum and count, so fetch both.
            select.push(format!("SUM({column}) AS avg_sum_{column}"));
            select.push(format!("COUNT({column}) AS avg_count_{column}"));
        }
        for column in &spec.min {
            select.push(format!("MIN({column}) AS min_{column}"));
        }
        for column in &spec.max {
            select.push(format!("MAX({column}) AS max_{column}"));
        }
    } else {
        select.extend(spec.group_by.iter().cloned());
        select.push("COUNT(*) AS count".to_string());
        for column in &spec.sum {
            select.push(format!("SUM({column}) AS sum_{column}"));
        }
    }

    let mut sql = format!("SELECT {} FROM {table}", select.join(", "));
    if let Some(filter) = &spec.filter {
        sql.push_str(&format!(" WHERE {}", filter.clause));
    }
    if !spec.group_by.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", spec.group_by.join(", ")));
    }
    Ok(sql)
}

/// Accumulates per-shard aggregate rows into a global result.
struct AggregateMerger<'a> {
    spec: &'a AggregateSpec,
    count: i64,
    saw_count: bool,
    sum: BTreeMap<String, f64>,
    avg_sum: BTreeMap<String, f64>,
    avg_count: BTreeMap<String, f64>,
    min: BTreeMap<String, Value>,
    max: BTreeMap<String, Value>,
    groups: BTreeMap<String, Row>,
}

impl<'a> AggregateMerger<'a> {
    fn new(spec: &'a AggregateSpec) -> Self {
        Self {
            spec,
            count: 0,
            saw_count: false,
            sum: BTreeMap::new(),
            avg_sum: BTreeMap::new(),
            avg_count: BTreeMap::new(),
            min: BTreeMap::new(),
            max: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    fn absorb(&mut self, rows: &[Row]) {
        if self.spec.group_by.is_empty() {
            if let Some(row) = rows.first() {
                self.absorb_scalar(row);
            }
            return;
        }
        for row in rows {
            self.absorb_group(row);
        }
    }

    fn absorb_scalar(&mut self, row: &Row) {
        if self.spec.count {
            if let Some(n) = row.get("count").and_then(Value::as_i64) {
                self.count += n;
                self.saw_count = true;
            }
        }
        for column in &self.spec.sum {
            if let Some(n) = row.get(&format!("sum_{column}")).and_then(as_number) {
                *self.sum.entry(column.clone()).or_insert(0.0) += n;
            }
        }
        for column in &self.spec.avg {
            if let Some(n) = row.get(&format!("avg_sum_{column}")).and_then(as_number) {
                *self.avg_sum.entry(column.clone()).or_insert(0.0) += n;
            }
            if let Some(n) = row.get(&format!("avg_count_{column}")).and_then(as_number) {
                *self.avg_count.entry(column.clone()).or_insert(0.0) += n;
            }
        }
        for column in &self.spec.min {
            if let Some(value) = row.get(&format!("min_{column}")) {
                take_extreme(&mut self.min, column, value, Ordering::Less);
            }
        }
        for column in &self.spec.max {
            if let Some(value) = row.get(&format!("max_{column}")) {
                take_extreme(&mut self.max, column, value, Ordering::Greater);
            }
        }
    }

    fn absorb_group(&mut self, row: &Row) {
        let key = self
            .spec
            .group_by
            .iter()
            .map(|col| row.get(col).cloned().unwrap_or(Value::Null).to_string())
            .collect::<Vec<_>>()
            .join("\u{1f}");

        match self.groups.get_mut(&key) {
            None => {
                self.groups.insert(key, row.clone());
            }
            Some(existing) => {
                let combined = existing.get("count").and_then(Value::as_i64).unwrap_or(0)
                    + row.get("count").and_then(Value::as_i64).unwrap_or(0);
                existing.insert("count".to_string(), Value::from(combined));

                for column in &self.spec.sum {
                    let field = format!("sum_{column}");
                    let combined = existing.get(&field).and_then(as_number).unwrap_or(0.0)
                        + row.get(&field).and_then(as_number).unwrap_or(0.0);
                    existing.insert(field, Value::from(combined));
                }
            }
        }
    }

    fn finish(self) -> AggregateResult {
        let mut avg = BTreeMap::new();
        for (column, total) in &self.avg_sum {
            let n = self.avg_count.get(column).copied().unwrap_or(0.0);
            if n > 0.0 {
                avg.insert(column.clone(), total / n);
            }
        }

        AggregateResult {
            count: self.saw_count.then_some(self.count),
            sum: self.sum,
            avg,
            min: self.min,
            max: self.max,
            groups: self.groups.into_values().collect(),
        }
    }
}

fn take_extreme(slot: &mut BTreeMap<String, Value>, column: &str, value: &Value, wanted: Ordering) {
    if value.is_null() {
        return;
    }
    match slot.get(column) {
        None => {
            slot.insert(column.to_string(), value.clone());
        }
        Some(current) => {
            if compare_values(value, current) == wanted {
                slot.insert(column.to_string(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_scalar_sql_shape() {
        let spec = AggregateSpec::default()
            .count()
            .sum(&["price"])
            .avg(&["rating"]);
        let sql = build_aggregate_sql("items", &spec).unwrap();

        assert!(sql.starts_with("SELECT COUNT(*) AS count, SUM(price) AS sum_price"));
        assert!(sql.contains("SUM(rating) AS avg_sum_rating"));
        assert!(sql.contains("COUNT(rating) AS avg_count_rating"));
        assert!(sql.ends_with("FROM items"));
    }

    #[test]
    fn test_grouped_sql_shape() {
        let spec = AggregateSpec::default().group_by(&["category"]).sum(&["price"]);
        let sql = build_aggregate_sql("items", &spec).unwrap();

        assert!(sql.contains("GROUP BY category"));
        assert!(sql.contains("COUNT(*) AS count"));
    }

    #[test]
    fn test_empty_spec_is_rejected() {
        assert!(build_aggregate_sql("items", &AggregateSpec::default()).is_err());
    }

    #[test]
    fn test_counts_and_sums_add() {
        let spec = AggregateSpec::default().count().sum(&["price", "quantity"]);
        let mut merger = AggregateMerger::new(&spec);

        merger.absorb(&[row(&[
            ("count", json!(100)),
            ("sum_price", json!(1000)),
            ("sum_quantity", json!(50)),
        ])]);
        merger.absorb(&[row(&[
            ("count", json!(150)),
            ("sum_price", json!(1500)),
            ("sum_quantity", json!(75)),
        ])]);

        let result = merger.finish();
        assert_eq!(result.count, Some(250));
        assert_eq!(result.sum["price"], 2500.0);
        assert_eq!(result.sum["quantity"], 125.0);
    }

    #[test]
    fn test_avg_is_recomputed_not_averaged() {
        let spec = AggregateSpec::default().avg(&["price"]);
        let mut merger = AggregateMerger::new(&spec);

        // shard 1: 2 rows totaling 10; shard 2: 8 rows totaling 30.
        merger.absorb(&[row(&[
            ("avg_sum_price", json!(10)),
            ("avg_count_price", json!(2)),
        ])]);
        merger.absorb(&[row(&[
            ("avg_sum_price", json!(30)),
            ("avg_count_price", json!(8)),
        ])]);

        // 40 / 10, not (5 + 3.75) / 2.
        assert_eq!(merger.finish().avg["price"], 4.0);
    }

    #[test]
    fn test_min_max_take_global_extremes() {
        let spec = AggregateSpec::default().min(&["price"]).max(&["price"]);
        let mut merger = AggregateMerger::new(&spec);

        merger.absorb(&[row(&[
            ("min_price", json!(10)),
            ("max_price", json!(100)),
        ])]);
        merger.absorb(&[row(&[
            ("min_price", json!(5)),
            ("max_price", json!(150)),
        ])]);

        let result = merger.finish();
        assert_eq!(result.min["price"], json!(5));
        assert_eq!(result.max["price"], json!(150));
    }

    #[test]
    fn test_groups_merge_by_key() {
        let spec = AggregateSpec::default().group_by(&["category"]);
        let mut merger = AggregateMerger::new(&spec);

        merger.absorb(&[
            row(&[("category", json!("A")), ("count", json!(10))]),
            row(&[("category", json!("B")), ("count", json!(20))]),
        ]);
        merger.absorb(&[
            row(&[("category", json!("A")), ("count", json!(15))]),
            row(&[("category", json!("C")), ("count", json!(25))]),
        ]);

        let mut groups = merger.finish().groups;
        groups.sort_by_key(|g| g["category"].as_str().unwrap_or("").to_string());

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0]["category"], json!("A"));
        assert_eq!(groups[0]["count"], json!(25));
        assert_eq!(groups[1]["count"], json!(20));
        assert_eq!(groups[2]["count"], json!(25));
    }
}

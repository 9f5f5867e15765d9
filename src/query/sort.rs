//! Global sort over merged rows
//!
//! Stable single-column sort with SQL-style NULL handling; ties keep
//! arrival order, so rows from the same shard stay in shard order.

use crate::core::{Row, compare_values};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: SortDirection::Desc,
        }
    }
}

/// Stable in-place sort of merged rows. A row missing the sort column
/// is treated as NULL and sorts last in ascending order.
pub fn sort_rows(rows: &mut [Row], order_by: &OrderBy) {
    rows.sort_by(|a, b| {
        let left = a.get(&order_by.column).unwrap_or(&Value::Null);
        let right = b.get(&order_by.column).unwrap_or(&Value::Null);
        let ordering = compare_values(left, right);
        match order_by.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
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
    fn test_sort_ascending() {
        let mut rows = vec![
            row(&[("value", json!(20))]),
            row(&[("value", json!(10))]),
            row(&[("value", json!(15))]),
        ];
        sort_rows(&mut rows, &OrderBy::asc("value"));

        let values: Vec<i64> = rows
            .iter()
            .map(|r| r["value"].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![10, 15, 20]);
    }

    #[test]
    fn test_sort_descending() {
        let mut rows = vec![
            row(&[("value", json!(10))]),
            row(&[("value", json!(25))]),
        ];
        sort_rows(&mut rows, &OrderBy::desc("value"));

        assert_eq!(rows[0]["value"], json!(25));
        assert_eq!(rows[1]["value"], json!(10));
    }

    #[test]
    fn test_missing_column_sorts_last_ascending() {
        let mut rows = vec![
            row(&[("other", json!(1))]),
            row(&[("value", json!(5))]),
        ];
        sort_rows(&mut rows, &OrderBy::asc("value"));

        assert_eq!(rows[0].get("value"), Some(&json!(5)));
        assert!(rows[1].get("value").is_none());
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let mut rows = vec![
            row(&[("value", json!(1)), ("tag", json!("first"))]),
            row(&[("value", json!(1)), ("tag", json!("second"))]),
        ];
        sort_rows(&mut rows, &OrderBy::asc("value"));

        assert_eq!(rows[0]["tag"], json!("first"));
        assert_eq!(rows[1]["tag"], json!("second"));
    }
}

use serde_json::Value;
use std::cmp::Ordering;

/// A result row as returned by a shard: a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Positional bind parameters for a statement.
pub type Params = Vec<Value>;

/// Total ordering over JSON values for global sorting.
///
/// SQL-style NULL handling: NULL sorts after every non-NULL value in
/// ascending order. Numbers compare numerically (integer and float mix
/// freely), strings lexicographically, booleans false-before-true.
/// Values of different kinds compare by a fixed kind rank so that the
/// ordering stays total and the surrounding sort stays stable.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,

        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }

        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),

        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        // NULLs are handled before rank comparison ever applies.
        Value::Null => 5,
    }
}

/// Numeric view of a JSON value, used when merging aggregates.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

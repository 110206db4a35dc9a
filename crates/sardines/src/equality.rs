//! # Settings equality
//!
//! Driver instances are memoized by the settings they were built from.
//! Settings arrive from several sources (config, registry responses, user
//! code) and differ in small ways that must not split the cache: a key set to
//! `null` versus a missing key, `8080` versus `"8080"`. The comparison here
//! is structural and forgiving about exactly those differences.

use serde_json::Value;

/// Structural equality where absent and `null` are interchangeable and
/// scalars compare loosely (`1 == "1" == true`).
///
/// Symmetric: `settings_eq(a, b) == settings_eq(b, a)`.
pub fn settings_eq(a: &Value, b: &Value) -> bool {
    loose_eq(Some(a), Some(b))
}

fn loose_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    let (a, b) = match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => return true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => return false,
        (Some(a), Some(b)) => (a, b),
    };

    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(Some(x), Some(y)))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.iter().all(|(k, x)| loose_eq(Some(x), ys.get(k)))
                && ys.iter().all(|(k, y)| loose_eq(xs.get(k), Some(y)))
        }
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (x, y) => match (loose_number(x), loose_number(y)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn loose_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Derives an opaque lookup key from an object's `key=value` pairs, ordered
/// by key name. Non-objects yield the empty key, which disables fast lookup.
pub fn fast_key(settings: &Value) -> String {
    let Value::Object(map) = settings else {
        return String::new();
    };
    let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", Value::from(k.as_str()), v))
        .collect::<Vec<_>>()
        .join(",")
}

//! Built-in request templates
//!
//! A template turns a loose parameter map (as a web form would post it) into
//! a complete request document. Template inputs are coerced leniently: a
//! value that cannot be read falls back to its default instead of failing.

mod stud;

use serde_json::{Map, Value};

pub use stud::{StudParams, basket_stud};

/// Number input; unreadable or non-finite values give `default`
pub fn lenient_f64(params: &Map<String, Value>, key: &str, default: f64) -> f64 {
    let value = match params.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    value.filter(|v| v.is_finite()).unwrap_or(default)
}

/// Whole-number input; fractional numbers are truncated, text must be an integer
pub fn lenient_i64(params: &Map<String, Value>, key: &str, default: i64) -> i64 {
    match params.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(default),
        Some(Value::Bool(b)) => i64::from(*b),
        _ => default,
    }
}

/// Toggle input; text is true for `1`, `true`, `yes` or `on`
pub fn lenient_bool(params: &Map<String, Value>, key: &str, default: bool) -> bool {
    match params.get(key) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_numbers() {
        let params = map(json!({"a": 2.5, "b": " 7 ", "c": "wide", "d": true, "e": null}));
        assert_eq!(lenient_f64(&params, "a", 1.0), 2.5);
        assert_eq!(lenient_f64(&params, "b", 1.0), 7.0);
        assert_eq!(lenient_f64(&params, "c", 1.0), 1.0);
        assert_eq!(lenient_f64(&params, "d", 0.0), 1.0);
        assert_eq!(lenient_f64(&params, "e", 3.0), 3.0);
        assert_eq!(lenient_f64(&params, "missing", 4.0), 4.0);
        assert_eq!(lenient_f64(&map(json!({"x": "NaN"})), "x", 4.0), 4.0);
    }

    #[test]
    fn test_integers() {
        let params = map(json!({"a": 6, "b": 5.9, "c": "6", "d": "6.0"}));
        assert_eq!(lenient_i64(&params, "a", 4), 6);
        assert_eq!(lenient_i64(&params, "b", 4), 5);
        assert_eq!(lenient_i64(&params, "c", 4), 6);
        assert_eq!(lenient_i64(&params, "d", 4), 4);
    }

    #[test]
    fn test_flags() {
        let params = map(json!({"a": "Yes", "b": "off", "c": 0, "d": null, "e": false}));
        assert!(lenient_bool(&params, "a", false));
        assert!(!lenient_bool(&params, "b", true));
        assert!(!lenient_bool(&params, "c", true));
        assert!(!lenient_bool(&params, "d", true));
        assert!(!lenient_bool(&params, "e", true));
        assert!(lenient_bool(&params, "missing", true));
    }
}

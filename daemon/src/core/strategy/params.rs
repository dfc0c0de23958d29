// Parameter extraction for strategy configuration. Parameters arrive as an
// opaque JSON map; each strategy pulls out what it needs exactly once, at
// parse time. Percent-like values accept numbers or strings, and anything
// above 1 is read as a percentage and scaled down.

use std::str::FromStr;

use costwise_common::{amount::Amount, model::LabelFilter};
use serde_json::Value;

pub(super) fn require_string(params: &Value, key: &str) -> Result<String, String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(format!(
            "parameter '{}' must be a non-empty string, got {}",
            key, other
        )),
        None => Err(format!("missing required parameter '{}'", key)),
    }
}

pub(super) fn require_percent(params: &Value, key: &str) -> Result<Amount, String> {
    let raw = params
        .get(key)
        .ok_or_else(|| format!("missing required parameter '{}'", key))?;
    let value = parse_amount(raw).map_err(|reason| format!("parameter '{}': {}", key, reason))?;
    if value.sign() < 0 {
        return Err(format!("parameter '{}' must not be negative", key));
    }
    if value > Amount::ONE {
        // 35 means 35%, 0.35 already is a ratio
        Ok(value.checked_div(Amount::ONE_HUNDRED).unwrap_or(value))
    } else {
        Ok(value)
    }
}

pub(super) fn optional_window_days(
    params: &Value,
    key: &str,
    default: u32,
) -> Result<u32, String> {
    let positive = |v: u32| {
        if v > 0 {
            Ok(v)
        } else {
            Err(format!("parameter '{}' must be a positive integer", key))
        }
    };
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| format!("parameter '{}' must be a positive integer", key))
            .and_then(positive),
        Some(Value::String(s)) => s
            .parse::<u32>()
            .map_err(|_| format!("parameter '{}' must be a positive integer", key))
            .and_then(positive),
        Some(other) => Err(format!(
            "parameter '{}' must be a positive integer, got {}",
            key, other
        )),
    }
}

pub(super) fn require_segment_filter(params: &Value, key: &str) -> Result<LabelFilter, String> {
    let raw = params
        .get(key)
        .ok_or_else(|| format!("missing required parameter '{}'", key))?;
    serde_json::from_value(raw.clone())
        .map_err(|err| format!("parameter '{}' is not a valid segment filter: {}", key, err))
}

fn parse_amount(value: &Value) -> Result<Amount, String> {
    match value {
        Value::String(s) => Amount::from_str(s).map_err(|err| err.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Amount::from(i))
            } else if let Some(f) = n.as_f64() {
                Amount::from_f64(f).map_err(|err| err.to_string())
            } else {
                Err(format!("number {} is out of range", n))
            }
        }
        other => Err(format!("expected a number or decimal string, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_percent_normalizes() {
        let params = json!({"as_ratio": 0.25, "as_percent": 25, "as_string": "25"});
        let quarter = Amount::from_str("0.25").unwrap();
        assert_eq!(require_percent(&params, "as_ratio").unwrap(), quarter);
        assert_eq!(require_percent(&params, "as_percent").unwrap(), quarter);
        assert_eq!(require_percent(&params, "as_string").unwrap(), quarter);
    }

    #[test]
    fn test_require_percent_rejects_negative_and_missing() {
        let params = json!({"percent": -5});
        assert!(require_percent(&params, "percent").is_err());
        assert!(require_percent(&params, "other").is_err());
    }

    #[test]
    fn test_exact_one_is_a_ratio() {
        // 1 means 100%, not 1%
        let params = json!({"percent": 1});
        assert_eq!(require_percent(&params, "percent").unwrap(), Amount::ONE);
    }

    #[test]
    fn test_window_days() {
        assert_eq!(optional_window_days(&json!({}), "window_days", 7).unwrap(), 7);
        assert_eq!(
            optional_window_days(&json!({"window_days": 30}), "window_days", 7).unwrap(),
            30
        );
        assert_eq!(
            optional_window_days(&json!({"window_days": "14"}), "window_days", 7).unwrap(),
            14
        );
        assert!(optional_window_days(&json!({"window_days": 0}), "window_days", 7).is_err());
        assert!(optional_window_days(&json!({"window_days": -3}), "window_days", 7).is_err());
    }

    #[test]
    fn test_segment_filter_parse() {
        let params = json!({
            "segment_filter": {"label": "tier", "operator": "in", "values": ["a", "b"]}
        });
        let filter = require_segment_filter(&params, "segment_filter").unwrap();
        assert_eq!(filter.label, "tier");
        assert_eq!(filter.values.len(), 2);
    }
}

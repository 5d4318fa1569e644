//! Human-readable duration strings used by instance and handler settings.

use std::time::Duration;

/// Parse a duration such as `"500ms"`, `"30s"`, `"2m"`, `"1h"` or a bare
/// number of seconds. Fractions and negative values are rejected.
///
/// ```
/// use script_runner::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("30s"), Some(Duration::from_secs(30)));
/// assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_duration_string("120"), Some(Duration::from_secs(120)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let n: u64 = digits.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "" | "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Read a timeout from a handler's JSON config: either a duration string or
/// a number of seconds (integer or fractional).
pub fn duration_from_value(value: Option<&serde_json::Value>, default: Duration) -> Duration {
    match value {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default),
        Some(serde_json::Value::String(s)) => parse_duration_string(s).unwrap_or(default),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_units() {
        assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration_string("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration_string("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_duration_string(" 250ms "),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_duration_string("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_duration_string(""), None);
        assert_eq!(parse_duration_string("soon"), None);
        assert_eq!(parse_duration_string("5x"), None);
        assert_eq!(parse_duration_string("-5s"), None);
        assert_eq!(parse_duration_string("1.5s"), None);
    }

    #[test]
    fn test_duration_from_value() {
        let default = Duration::from_secs(30);
        assert_eq!(
            duration_from_value(Some(&json!(2)), default),
            Duration::from_secs(2)
        );
        assert_eq!(
            duration_from_value(Some(&json!(0.5)), default),
            Duration::from_millis(500)
        );
        assert_eq!(
            duration_from_value(Some(&json!("1m")), default),
            Duration::from_secs(60)
        );
        assert_eq!(duration_from_value(Some(&json!(-1)), default), default);
        assert_eq!(duration_from_value(None, default), default);
    }
}

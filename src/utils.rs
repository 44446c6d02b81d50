use std::time::Duration;

use crate::error::ConfigError;

/// Parse a human duration such as `500ms`, `30s`, `2m`, `1m30s` or `1h`.
///
/// A bare number is taken as seconds. Units may be chained (`1h30m`), each
/// segment must carry its own unit in that case.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    if let Ok(seconds) = s.parse::<f64>() {
        return seconds_to_duration(seconds, input);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
        if digits_end == 0 {
            return Err(ConfigError::InvalidDuration(input.to_string()));
        }
        let value: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let multiplier = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(ConfigError::InvalidDuration(input.to_string())),
        };
        rest = &rest[unit_end..];
        total = total
            .checked_add(seconds_to_duration(value * multiplier, input)?)
            .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
    }

    Ok(total)
}

pub(crate) fn seconds_to_duration(seconds: f64, input: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| ConfigError::InvalidDuration(input.to_string()))
}

/// Format a duration the way it is accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_compound_and_bare() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "10x", "s", "-5s", "1m30"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_parse_rejects_overflow() {
        for huge in [
            "1e300",
            "1000000000000000000h",
            "10000000000000000000s10000000000000000000s",
        ] {
            assert!(
                matches!(parse_duration(huge), Err(ConfigError::InvalidDuration(_))),
                "{huge} should be rejected"
            );
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}

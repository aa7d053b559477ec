//! Duration string parsing and uptime formatting.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Error for a duration string that does not match `<number><m|h|d>`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid duration format: {0}. Use formats like 30m, 2h, 7d")]
pub struct DurationParseError(pub String);

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(m|h|d)$").expect("valid duration regex"))
}

/// Parse a duration string like `30m`, `2h`, or `7d` into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let caps = duration_re()
        .captures(s)
        .ok_or_else(|| DurationParseError(s.to_string()))?;

    let value: u64 = caps[1]
        .parse()
        .map_err(|_| DurationParseError(s.to_string()))?;
    let secs = match &caps[2] {
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => unreachable!(),
    };
    Ok(Duration::from_secs(secs))
}

/// Format an elapsed duration as a short human-readable uptime string.
///
/// `"1h 2m"`, `"3m 5s"`, or `"12s"` depending on magnitude.
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minutes_hours_days() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn parse_rejects_bad_formats() {
        for bad in ["", "30", "m", "30s", "1.5h", "2 h", "-1m", "h2"] {
            assert!(parse_duration(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn parse_rejects_overflowing_value() {
        assert!(parse_duration("99999999999999999999m").is_err());
    }

    #[test]
    fn uptime_formats() {
        assert_eq!(format_uptime(Duration::from_secs(12)), "12s");
        assert_eq!(format_uptime(Duration::from_secs(185)), "3m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3720)), "1h 2m");
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
    }
}

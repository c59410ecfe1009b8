//! Compact human durations: `2w`, `90d`, `1w 2d`, `4h30m`, `45s`.
//!
//! A week is seven days. Every token is a positive integer followed by one
//! unit letter; tokens may be separated by whitespace. Bare numbers, unknown
//! units, an all-zero total and anything longer than [`MAX`] are rejected.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{ApertureError, Result};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Longest accepted duration: 100 years of days.
pub const MAX: Duration = Duration::from_secs(36_500 * DAY);

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s*([wdhms])").unwrap())
}

/// Parse a compact duration string.
pub fn parse(input: &str) -> Result<Duration> {
    let invalid = || ApertureError::InvalidDuration(input.to_string());
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    while !rest.is_empty() {
        let caps = token_re().captures(rest).ok_or_else(invalid)?;
        let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = match &caps[2] {
            "w" => WEEK,
            "d" => DAY,
            "h" => HOUR,
            "m" => MINUTE,
            _ => 1,
        };
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        rest = rest[caps[0].len()..].trim_start();
    }

    if total == 0 || total > MAX.as_secs() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Parse `input`, falling back to `default` (which must itself parse) when
/// `input` is missing or malformed.
pub fn parse_or(input: Option<&str>, default: &str) -> Duration {
    if let Some(raw) = input {
        match parse(raw) {
            Ok(d) => return d,
            Err(e) => {
                tracing::warn!(value = %raw, default, error = %e, "invalid duration, using default");
            }
        }
    }
    parse(default).unwrap_or(Duration::from_secs(2 * WEEK))
}

/// Render a duration back into the compact grammar (largest units first).
pub fn format(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, label) in [(WEEK, 'w'), (DAY, 'd'), (HOUR, 'h'), (MINUTE, 'm'), (1, 's')] {
        let n = secs / unit;
        if n > 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&n.to_string());
            out.push(label);
            secs %= unit;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse("2w").unwrap(), Duration::from_secs(14 * DAY));
        assert_eq!(parse("90d").unwrap(), Duration::from_secs(90 * DAY));
        assert_eq!(parse("3h").unwrap(), Duration::from_secs(3 * HOUR));
        assert_eq!(parse("15m").unwrap(), Duration::from_secs(15 * MINUTE));
        assert_eq!(parse("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn parses_combined_tokens() {
        assert_eq!(parse("1w 2d").unwrap(), Duration::from_secs(9 * DAY));
        assert_eq!(
            parse("4h30m").unwrap(),
            Duration::from_secs(4 * HOUR + 30 * MINUTE)
        );
        assert_eq!(parse("  1d  1s ").unwrap(), Duration::from_secs(DAY + 1));
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "   ", "10", "2y", "w", "2 weeks", "0d", "1d x", "-1d"] {
            assert!(parse(bad).is_err(), "expected invalid: {bad:?}");
        }
    }

    #[test]
    fn rejects_durations_past_a_century() {
        assert!(parse("100000000w").is_err());
        assert!(parse("36501d").is_err());
        assert_eq!(parse("36500d").unwrap(), MAX);
        assert_eq!(parse_or(Some("100000000w"), "2w"), Duration::from_secs(14 * DAY));
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or(Some("soon"), "2w"), Duration::from_secs(14 * DAY));
        assert_eq!(parse_or(None, "1w"), Duration::from_secs(WEEK));
        assert_eq!(parse_or(Some("3d"), "1w"), Duration::from_secs(3 * DAY));
    }

    #[test]
    fn format_uses_largest_units() {
        assert_eq!(format(Duration::from_secs(9 * DAY)), "1w 2d");
        assert_eq!(format(Duration::from_secs(HOUR + 5)), "1h 5s");
        assert_eq!(format(Duration::ZERO), "0s");
        assert_eq!(parse(&format(Duration::from_secs(777_777))).unwrap().as_secs(), 777_777);
    }
}

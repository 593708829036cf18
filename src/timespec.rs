//! Parsing of dashboard-supplied time specifications.
//!
//! Dashboards send either absolute stamps (seconds-since-epoch, or the
//! `HH:MM_YYYYMMDD` form some emit) or relative expressions like `-30min`.
//! The two fixed absolute formats are tried first; everything else is marked
//! relative and handed to the expression evaluator, with unparseable input
//! degrading to "now" rather than an error.

use chrono::{Local, NaiveDateTime, TimeZone};
use tracing::warn;

/// Parse a time specification against the given "now" timestamp.
///
/// Returns the absolute timestamp and whether the input was a relative
/// expression.  Empty and unparseable input both degrade to `now`.
pub fn parse_timespec(value: &str, now: i64) -> (i64, bool) {
    if value.is_empty() {
        warn!("empty time specification");
        return (now, false);
    }

    // seconds-since-epoch, as emitted by newer dashboards
    if let Ok(epoch) = value.parse::<i64>() {
        return (epoch, false);
    }

    // the HH:MM_YYYYMMDD absolute form, interpreted in local time
    if let Ok(stamp) = NaiveDateTime::parse_from_str(value, "%H:%M_%Y%m%d") {
        if let Some(local) = Local.from_local_datetime(&stamp).earliest() {
            return (local.timestamp(), false);
        }
    }

    // Whether the remainder is relative can't be detected unambiguously, so
    // presume it is.  A non-negative expression is led toward an absolute
    // interpretation with the `@` marker.
    let expr = if value.starts_with('-') {
        value.to_string()
    } else {
        format!("@{}", value)
    };

    match eval_time_expr(&expr, now) {
        Some(t) => (t, true),
        None => {
            warn!(spec = value, "unparseable time specification");
            (now, true)
        }
    }
}

/// Seconds per unit for the relative-offset vocabulary dashboards emit.
/// Months and years are calendar approximations, which is acceptable here.
fn unit_seconds(unit: &str) -> Option<i64> {
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hour" | "hours" => Some(3600),
        "d" | "day" | "days" => Some(86400),
        "w" | "week" | "weeks" => Some(604800),
        "mon" | "month" | "months" => Some(2_592_000),
        "y" | "year" | "years" => Some(31_536_000),
        _ => None,
    }
}

/// Evaluate a normalized time expression: `now`, `@<epoch>`, or a signed
/// `<count><unit>` offset from `now`.  Returns None on syntax errors.
fn eval_time_expr(expr: &str, now: i64) -> Option<i64> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix('@') {
        if rest == "now" {
            return Some(now);
        }
        return rest.parse::<i64>().ok();
    }
    if expr == "now" {
        return Some(now);
    }

    let (sign, rest) = match expr.strip_prefix('-') {
        Some(r) => (-1, r),
        None => (1, expr.strip_prefix('+').unwrap_or(expr)),
    };
    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits == 0 {
        return None;
    }
    let count: i64 = rest[..digits].parse().ok()?;
    let unit = unit_seconds(&rest[digits..])?;
    Some(now + sign * count * unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn epoch_is_absolute() {
        assert_eq!(parse_timespec("1699990000", NOW), (1_699_990_000, false));
    }

    #[test]
    fn clock_date_form_is_absolute() {
        let (parsed, relative) = parse_timespec("14:30_20231110", NOW);
        assert!(!relative);
        let expected = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("14:30_20231110", "%H:%M_%Y%m%d").unwrap(),
            )
            .earliest()
            .unwrap()
            .timestamp();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn relative_offsets() {
        assert_eq!(parse_timespec("-0hour", NOW), (NOW, true));
        assert_eq!(parse_timespec("-90min", NOW), (NOW - 5400, true));
        assert_eq!(parse_timespec("-1day", NOW), (NOW - 86400, true));
        assert_eq!(parse_timespec("-2w", NOW), (NOW - 1_209_600, true));
    }

    #[test]
    fn empty_and_garbage_degrade_to_now() {
        assert_eq!(parse_timespec("", NOW), (NOW, false));
        assert_eq!(parse_timespec("next tuesday", NOW), (NOW, true));
        assert_eq!(parse_timespec("-minutes", NOW), (NOW, true));
    }

    #[test]
    fn now_keyword() {
        assert_eq!(parse_timespec("now", NOW), (NOW, true));
    }
}

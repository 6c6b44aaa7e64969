//! Compose duration strings ("1m30s", "1.5s", "500ms", "10")

use crate::error::{MusterError, Result};
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Unit suffixes and their length in nanoseconds, largest first
const UNITS: &[(&str, u128)] = &[
    ("d", 86_400 * NANOS_PER_SEC),
    ("h", 3_600 * NANOS_PER_SEC),
    ("m", 60 * NANOS_PER_SEC),
    ("s", NANOS_PER_SEC),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("µs", 1_000),
    ("ns", 1),
];

/// Parse a compose duration string.
///
/// Accepts a sequence of `<number><unit>` groups (`1h2m3s`, `1m30s`,
/// `1.5s`, `250ms`, `500us`). A bare number is read as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let s = value.trim();
    if s.is_empty() {
        return Err(invalid(value, "empty duration"));
    }

    if s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        let nanos = scaled(value, s, NANOS_PER_SEC)?;
        return to_duration(value, nanos);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid(value, "expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let nanos_per_unit = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, nanos)| *nanos)
            .ok_or_else(|| invalid(value, &format!("unknown unit '{}'", unit)))?;

        total += scaled(value, number, nanos_per_unit)?;
        rest = next;
    }

    to_duration(value, total)
}

/// `number` (with an optional fraction) multiplied by `unit` nanoseconds
fn scaled(value: &str, number: &str, unit: u128) -> Result<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(invalid(value, "malformed number"));
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| invalid(value, "number out of range"))?
    };
    let mut nanos = whole
        .checked_mul(unit)
        .ok_or_else(|| invalid(value, "duration too large"))?;

    // Digits past nanosecond precision are dropped
    let fraction = &fraction[..fraction.len().min(18)];
    if !fraction.is_empty() {
        let digits: u128 = fraction
            .parse()
            .map_err(|_| invalid(value, "malformed number"))?;
        nanos += digits * unit / 10u128.pow(fraction.len() as u32);
    }
    Ok(nanos)
}

fn to_duration(value: &str, nanos: u128) -> Result<Duration> {
    let secs = u64::try_from(nanos / NANOS_PER_SEC)
        .map_err(|_| invalid(value, "duration too large"))?;
    Ok(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
}

/// Format a duration using the largest units that fit ("1m30s", "250ms")
pub fn format_duration(duration: &Duration) -> String {
    let mut nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, size) in UNITS.iter().filter(|(unit, _)| *unit != "µs") {
        if nanos >= *size {
            out.push_str(&format!("{}{}", nanos / size, unit));
            nanos %= size;
        }
    }
    out
}

fn invalid(value: &str, message: &str) -> MusterError {
    MusterError::InvalidDuration {
        value: value.to_string(),
        message: message.to_string(),
    }
}

/// Serde adapter storing durations as compose strings
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

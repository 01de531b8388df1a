//! Human duration strings: "250ms", "90s", "2m", "1h30m".
//!
//! Deployment sources write per-operation ceilings this way (`create: 1m`),
//! so both declarations and engine config accept the same notation.

use crate::error::{Error, Result};
use std::time::Duration;

pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InvalidDuration(input.to_string()));
    }
    // Bare integers are seconds.
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(Error::InvalidDuration(input.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidDuration(input.to_string()))?;
        digits.clear();
        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(value))
            }
            'h' => value.checked_mul(3600).map(Duration::from_secs),
            'm' => value.checked_mul(60).map(Duration::from_secs),
            's' => Some(Duration::from_secs(value)),
            _ => return Err(Error::InvalidDuration(input.to_string())),
        };
        total = unit
            .and_then(|u| total.checked_add(u))
            .ok_or_else(|| Error::InvalidDuration(input.to_string()))?;
    }
    if !digits.is_empty() {
        return Err(Error::InvalidDuration(input.to_string()));
    }
    Ok(total)
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    if secs >= 3600 {
        out.push_str(&format!("{}h", secs / 3600));
        secs %= 3600;
    }
    if secs >= 60 {
        out.push_str(&format!("{}m", secs / 60));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}

pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let raw: String = serde::Deserialize::deserialize(d)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Serde adapter for `Option<Duration>` fields.
pub mod option {
    use super::{format_duration, parse_duration};
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let raw: Option<String> = serde::Deserialize::deserialize(d)?;
        raw.map(|r| parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_notation() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("10m5").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            parse_duration("18446744073709551615h"),
            Err(Error::InvalidDuration(_))
        ));
        assert!(parse_duration("18446744073709551615m").is_err());
        assert!(parse_duration("18446744073709551615s18446744073709551615s").is_err());
    }

    #[test]
    fn formats_compactly() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}

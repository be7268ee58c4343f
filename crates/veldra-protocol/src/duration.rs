// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duration-string parsing for opcode options.
//!
//! SDKs express timeouts and sleeps as compact duration strings such as
//! `"30s"`, `"1m30s"`, `"6h"`, `"7d"`. Units: `ms`, `s`, `m`, `h`, `d`, `w`.

use std::time::Duration;

use crate::ProtocolError;

/// Parse a duration string into a [`Duration`].
///
/// Multiple segments accumulate (`"1h30m"` is ninety minutes). Fractional
/// values are accepted (`"1.5h"`).
pub fn parse_duration(input: &str) -> Result<Duration, ProtocolError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ProtocolError::InvalidDuration(input.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut seen_segment = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        if !c.is_ascii_alphabetic() || num.is_empty() {
            return Err(ProtocolError::InvalidDuration(input.to_string()));
        }

        let mut unit = String::new();
        unit.push(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }

        let value: f64 = num
            .parse()
            .map_err(|_| ProtocolError::InvalidDuration(input.to_string()))?;
        num.clear();

        let seconds = match unit.as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "d" => value * 86400.0,
            "w" => value * 604800.0,
            _ => return Err(ProtocolError::InvalidDuration(input.to_string())),
        };
        total += Duration::from_secs_f64(seconds);
        seen_segment = true;
    }

    // A trailing bare number has no unit.
    if !num.is_empty() || !seen_segment {
        return Err(ProtocolError::InvalidDuration(input.to_string()));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(21600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604800));
    }

    #[test]
    fn accumulates_segments() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_duration("1h30m15s").unwrap(),
            Duration::from_secs(5415)
        );
    }

    #[test]
    fn accepts_fractional_values() {
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10y").is_err());
        assert!(parse_duration("ten seconds").is_err());
    }
}

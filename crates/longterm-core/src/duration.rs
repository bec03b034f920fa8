//! Human duration strings.
//!
//! Accepts a bare number of seconds (`"3600"`) or one or more
//! `<number><unit>` groups (`"1d"`, `"2h"`, `"1d12h"`), where the unit is
//! one of `s`, `m`, `h`, `d`, `w`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration {0:?}")]
    Invalid(String),

    #[error("unknown duration unit {unit:?} in {input:?}")]
    UnknownUnit { input: String, unit: char },

    #[error("duration {0:?} is too large")]
    Overflow(String),
}

fn unit_secs(unit: char) -> Option<u64> {
    match unit {
        's' => Some(1),
        'm' => Some(60),
        'h' => Some(60 * 60),
        'd' => Some(24 * 60 * 60),
        'w' => Some(7 * 24 * 60 * 60),
        _ => None,
    }
}

/// Parse a duration string into whole seconds.
pub fn parse_duration(input: &str) -> Result<u64, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map_err(|_| DurationError::Overflow(input.to_string()));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            return Err(DurationError::Invalid(input.to_string()));
        }
        let factor = unit_secs(c.to_ascii_lowercase()).ok_or_else(|| DurationError::UnknownUnit {
            input: input.to_string(),
            unit: c,
        })?;
        let amount: u64 = digits
            .parse()
            .map_err(|_| DurationError::Overflow(input.to_string()))?;
        total = amount
            .checked_mul(factor)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;
        digits.clear();
    }

    // A trailing number without a unit ("1d3") is ambiguous.
    if !digits.is_empty() {
        return Err(DurationError::Invalid(input.to_string()));
    }

    Ok(total)
}

/// Render seconds back into the largest exact unit (`86400` → `"1d"`).
pub fn format_duration(secs: u64) -> String {
    for (unit, factor) in [('w', 604_800), ('d', 86_400), ('h', 3_600), ('m', 60)] {
        if secs != 0 && secs % factor == 0 {
            return format!("{}{unit}", secs / factor);
        }
    }
    format!("{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_units() {
        assert_eq!(parse_duration("45s"), Ok(45));
        assert_eq!(parse_duration("30m"), Ok(1_800));
        assert_eq!(parse_duration("2h"), Ok(7_200));
        assert_eq!(parse_duration("1d"), Ok(86_400));
        assert_eq!(parse_duration("1w"), Ok(604_800));
        assert_eq!(parse_duration("2D"), Ok(172_800));
    }

    #[test]
    fn bare_seconds() {
        assert_eq!(parse_duration("3600"), Ok(3_600));
        assert_eq!(parse_duration(" 0 "), Ok(0));
    }

    #[test]
    fn compound() {
        assert_eq!(parse_duration("1d12h"), Ok(129_600));
        assert_eq!(parse_duration("1h30m15s"), Ok(5_415));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(parse_duration("d"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("1d3"), Err(DurationError::Invalid(_))));
        assert!(matches!(
            parse_duration("5y"),
            Err(DurationError::UnknownUnit { unit: 'y', .. })
        ));
        assert!(matches!(
            parse_duration("99999999999999999999w"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn formats_largest_exact_unit() {
        assert_eq!(format_duration(86_400), "1d");
        assert_eq!(format_duration(172_800), "2d");
        assert_eq!(format_duration(5_400), "90m");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(0), "0s");
    }
}

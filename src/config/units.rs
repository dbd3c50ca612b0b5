// Parsing of human-friendly sizes, durations and date formats in descriptors

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for every configured duration
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// A descriptor value that may be written as a number or a suffixed string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(u64),
    Text(String),
}

/// Parse a memory size such as `1G`, `512M`, `200K` or a plain byte count.
///
/// Suffixes are 1024-based and case-insensitive; a trailing `B` is accepted.
pub fn parse_memory(value: &Quantity) -> Result<u64, String> {
    let text = match value {
        Quantity::Number(n) => return Ok(*n),
        Quantity::Text(s) => s.trim(),
    };

    let upper = text.to_ascii_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1024u64),
        Some('M') => (&upper[..upper.len() - 1], 1024 * 1024),
        Some('G') => (&upper[..upper.len() - 1], 1024 * 1024 * 1024),
        _ => (upper, 1),
    };

    let amount: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size: '{}'", text))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(format!("invalid memory size: '{}'", text));
    }

    Ok((amount * multiplier as f64) as u64)
}

/// Parse a duration: integer milliseconds, or a string with `ms`, `s`, `m` or `h`
pub fn parse_duration(value: &Quantity) -> Result<Duration, String> {
    let text = match value {
        Quantity::Number(ms) => return Ok(Duration::from_millis(*ms)),
        Quantity::Text(s) => s.trim(),
    };

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: '{}'", text))?;

    let too_large = || format!("duration out of range: '{}'", text);
    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => amount
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(too_large),
        "h" => amount
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(too_large),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, text)),
    }
}

/// `start + after`, or a deadline a day past `start` when the sum does not fit
pub fn deadline_after(start: tokio::time::Instant, after: Duration) -> tokio::time::Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + MAX_DURATION)
}

/// Translate a moment-style date format (`YYYY-MM-DD HH:mm:ss Z`) into a chrono format string.
///
/// Unknown letters are kept literally; `%` is escaped.
pub fn translate_date_format(moment: &str) -> Result<String, String> {
    const TOKENS: &[(&str, &str)] = &[
        ("YYYY", "%Y"),
        ("SSS", "%3f"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("ZZ", "%z"),
        ("Z", "%:z"),
        ("A", "%p"),
    ];

    let mut out = String::with_capacity(moment.len() * 2);
    let mut rest = moment;
    'outer: while !rest.is_empty() {
        for (token, strftime) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(strftime);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }

    let invalid = chrono::format::StrftimeItems::new(&out)
        .any(|item| matches!(item, chrono::format::Item::Error));
    if invalid {
        return Err(format!("unsupported log_date_format: '{}'", moment));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Quantity {
        Quantity::Text(s.to_string())
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory(&text("1G")).unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory(&text("512M")).unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory(&text("200k")).unwrap(), 200 * 1024);
        assert_eq!(parse_memory(&text("1.5GB")).unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_memory(&text("4096")).unwrap(), 4096);
        assert_eq!(parse_memory(&Quantity::Number(10)).unwrap(), 10);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory(&text("lots")).is_err());
        assert!(parse_memory(&text("-1G")).is_err());
        assert!(parse_memory(&text("")).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(&Quantity::Number(1500)).unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(&text("250ms")).unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(&text("5s")).unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration(&text("2m")).unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(&text("1h")).unwrap(), Duration::from_secs(3600));
        assert!(parse_duration(&text("5 weeks")).is_err());
        assert!(parse_duration(&text("soon")).is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        let err = parse_duration(&text("99999999999999999h")).unwrap_err();
        assert!(err.contains("out of range"));
        assert!(parse_duration(&text("999999999999999999m")).is_err());
    }

    #[test]
    fn test_deadline_after_saturates() {
        let start = tokio::time::Instant::now();
        assert_eq!(
            deadline_after(start, Duration::from_secs(1)),
            start + Duration::from_secs(1)
        );
        assert_eq!(deadline_after(start, Duration::MAX), start + MAX_DURATION);
    }

    #[test]
    fn test_translate_ecosystem_date_format() {
        assert_eq!(
            translate_date_format("YYYY-MM-DD HH:mm:ss Z").unwrap(),
            "%Y-%m-%d %H:%M:%S %:z"
        );
        assert_eq!(translate_date_format("HH:mm:ss.SSS").unwrap(), "%H:%M:%S.%3f");
        assert_eq!(translate_date_format("100% DD").unwrap(), "100%% %d");
    }
}

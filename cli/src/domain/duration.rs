//! Human duration strings used in templates: `500ms`, `20s`, `200m`, `1h30m`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static SEGMENT_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)"));

/// Parse a sequence of `<number><unit>` segments into a [`Duration`].
///
/// Units are `h`, `m`, `s` and `ms`. Segments are summed, so `1h30m` is
/// ninety minutes. Whitespace and bare numbers are rejected.
///
/// # Errors
///
/// Returns a human-readable reason when the string is empty, contains
/// anything other than unit segments, or overflows.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let segments = SEGMENT_RE
        .as_ref()
        .map_err(|e| format!("duration pattern: {e}"))?;
    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in segments.captures_iter(input) {
        let (Some(whole), Some(number), Some(unit)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if whole.start() != consumed {
            return Err(format!("unexpected text at offset {consumed}"));
        }
        consumed = whole.end();

        let n: u64 = number
            .as_str()
            .parse()
            .map_err(|_| format!("number too large: {}", number.as_str()))?;
        let segment = match unit.as_str() {
            "h" => n.checked_mul(3600).map(Duration::from_secs),
            "m" => n.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(n)),
            _ => Some(Duration::from_millis(n)),
        }
        .ok_or_else(|| "duration overflows".to_string())?;
        total = total
            .checked_add(segment)
            .ok_or_else(|| "duration overflows".to_string())?;
    }

    if consumed != input.len() {
        return Err(format!(
            "expected segments like 20s, 5m or 1h30m (unit missing at offset {consumed})"
        ));
    }
    Ok(total)
}

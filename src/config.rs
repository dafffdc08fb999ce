//! Duration parsing for CLI flags.

use std::time::Duration;

/// Parse a duration string like "100ms", "5s", "2m", "1h" into a
/// [`Duration`]. A bare number is interpreted as milliseconds, which is
/// the natural unit for chunk timing flags.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(num) = s.strip_suffix("ms") {
        let millis: u64 = num
            .parse()
            .map_err(|_| format!("invalid milliseconds value: {num}"))?;
        return Ok(Duration::from_millis(millis));
    }
    if let Some(num) = s.strip_suffix('h') {
        let hours: u64 = num
            .parse()
            .map_err(|_| format!("invalid hours value: {num}"))?;
        return Ok(Duration::from_secs(hours * 3600));
    }
    if let Some(num) = s.strip_suffix('m') {
        let minutes: u64 = num
            .parse()
            .map_err(|_| format!("invalid minutes value: {num}"))?;
        return Ok(Duration::from_secs(minutes * 60));
    }
    if let Some(num) = s.strip_suffix('s') {
        let secs: u64 = num
            .parse()
            .map_err(|_| format!("invalid seconds value: {num}"))?;
        return Ok(Duration::from_secs(secs));
    }
    let millis: u64 = s
        .parse()
        .map_err(|_| format!("invalid duration value: {s}"))?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms"), Ok(Duration::from_millis(100)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250"), Ok(Duration::from_millis(250)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
    }
}

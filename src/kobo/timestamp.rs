//! Timestamp parsing and canonical formatting for the device protocol.
//!
//! Devices send timestamps in several shapes and do not guarantee sub-second
//! fidelity, so every instant is truncated to whole seconds. An unparseable
//! or blank value is `None`, and `None` always loses an ordering comparison.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

/// Canonical wire form: seven fractional digits, always zero.
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.0000000Z";

/// Offset-less layouts, read as UTC.
const LOCAL_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn parse(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(0));
    }

    LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().trunc_subsecs(0))
}

pub fn parse_opt(text: Option<&str>) -> Option<DateTime<Utc>> {
    text.and_then(parse)
}

pub fn format(instant: DateTime<Utc>) -> String {
    instant.format(CANONICAL_FORMAT).to_string()
}

/// Reformat a parseable timestamp canonically; anything else passes through.
pub fn normalize(text: &str) -> String {
    match parse(text) {
        Some(instant) => format(instant),
        None => text.to_string(),
    }
}

pub fn normalize_opt(text: Option<&str>) -> Option<String> {
    text.map(normalize)
}

/// True when `candidate` is present and either `baseline` is absent or
/// `candidate` is strictly later. Both sides are compared in whole seconds,
/// so equal seconds are not "after".
pub fn is_strictly_after(candidate: Option<DateTime<Utc>>, baseline: Option<DateTime<Utc>>) -> bool {
    match (candidate, baseline) {
        (Some(candidate), Some(baseline)) => candidate.trunc_subsecs(0) > baseline.trunc_subsecs(0),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Latest parseable instant among `values`.
pub fn latest<'a, I>(values: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values.into_iter().filter_map(parse_opt).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_accepts_device_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();

        assert_eq!(parse("2024-05-06T07:08:09Z"), Some(expected));
        assert_eq!(parse("2024-05-06T07:08:09.1234567Z"), Some(expected));
        assert_eq!(parse("2024-05-06T09:08:09+02:00"), Some(expected));
        assert_eq!(parse("2024-05-06 07:08:09"), Some(expected));
        assert_eq!(parse("2024-05-06 07:08:09.999999999"), Some(expected));
        assert_eq!(parse("2024-05-06T07:08:09"), Some(expected));
        assert_eq!(parse("  2024-05-06T07:08:09Z "), Some(expected));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("yesterday"), None);
        assert_eq!(parse("2024-13-40T00:00:00Z"), None);
        assert_eq!(parse_opt(None), None);
    }

    #[test]
    fn test_normalize_is_canonical_and_idempotent() {
        let inputs = [
            "2024-05-06T07:08:09.987Z",
            "2024-05-06 07:08:09",
            "2024-05-06T09:08:09+02:00",
            "2024-05-06T07:08:09.0000000Z",
        ];

        for input in inputs {
            let once = normalize(input);
            assert_eq!(once, "2024-05-06T07:08:09.0000000Z", "input {input}");
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_normalize_passes_through_unparseable() {
        assert_eq!(normalize("not a date"), "not a date");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize_opt(None), None);
    }

    #[test]
    fn test_absent_always_loses() {
        let earlier = parse("2024-05-06T07:08:09Z");
        let later = parse("2024-05-06T07:08:10Z");

        assert!(is_strictly_after(later, earlier));
        assert!(!is_strictly_after(earlier, later));
        assert!(!is_strictly_after(earlier, earlier));
        assert!(is_strictly_after(earlier, None));
        assert!(!is_strictly_after(None, earlier));
        assert!(!is_strictly_after(None, None));
    }

    #[test]
    fn test_sub_second_differences_tie() {
        let a = parse("2024-05-06T07:08:09.100Z");
        let b = parse("2024-05-06T07:08:09.900Z");
        assert!(!is_strictly_after(b, a));
    }

    #[test]
    fn test_server_instants_compare_in_whole_seconds() {
        let device = parse("2024-05-06T07:08:09Z");
        let server = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap() + chrono::TimeDelta::milliseconds(500);

        assert!(!is_strictly_after(Some(server), device));
        assert!(!is_strictly_after(device, Some(server)));
        assert!(is_strictly_after(Some(server + chrono::TimeDelta::seconds(1)), device));
    }

    #[test]
    fn test_latest_skips_unparseable() {
        let latest = latest([Some("junk"), None, Some("2024-01-01T00:00:00Z"), Some("2024-02-01 00:00:00")]);
        assert_eq!(latest, parse("2024-02-01T00:00:00Z"));
        assert_eq!(super::latest([Some("junk"), None]), None);
    }
}

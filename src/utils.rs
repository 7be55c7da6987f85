//! Shared helpers: fossilized-string escaping for card arguments, simple
//! pathname validation, control-artifact sniffing, the binary-content
//! heuristic, and Julian-day time conversions.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use memchr::memchr;

/// Seconds per day; Julian day 2440587.5 is the Unix epoch.
const JD_UNIX_EPOCH: f64 = 2440587.5;
const SECONDS_PER_DAY: f64 = 86400.0;

/// Escape a card argument: controls and spaces become backslash sequences
/// so every card stays a single line of space-separated tokens.
pub fn fossilize(z: &str) -> String {
    let mut out = String::with_capacity(z.len());
    for c in z.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{b}' => out.push_str("\\v"),
            '\u{c}' => out.push_str("\\f"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`fossilize`]. Unknown escapes pass the escaped byte through
/// unchanged, matching the wire format's tolerance for future sequences.
pub fn defossilize(z: &str) -> String {
    let mut out = String::with_capacity(z.len());
    let mut chars = z.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('v') => out.push('\u{b}'),
            Some('f') => out.push('\u{c}'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// True if `z` is a simple repository-relative pathname: no empty
/// elements, no `.` or `..` elements, no leading or duplicate `/`, no
/// backslash, no control bytes.
pub fn is_simple_pathname(z: &str) -> bool {
    if z.is_empty() || z.starts_with('/') || z.ends_with('/') {
        return false;
    }
    for b in z.bytes() {
        if b < 0x20 || b == b'\\' {
            return false;
        }
    }
    z.split('/').all(|elem| !elem.is_empty() && elem != "." && elem != "..")
}

/// Return true if the blob might be a parsable control artifact.  Cheap
/// pre-filter used by rebuild/reconstruct before attempting a real parse.
pub fn looks_like_control_artifact(content: &[u8]) -> bool {
    if content.len() < 10 {
        return false;
    }
    if content.starts_with(b"-----BEGIN PGP SIGNED MESSAGE-----") {
        return true;
    }
    content[0].is_ascii_uppercase() && content[1] == b' ' && content[content.len() - 1] == b'\n'
}

/// Binary-content heuristic: any NUL byte marks the buffer as binary for
/// merge purposes.
pub fn looks_like_binary(content: &[u8]) -> bool {
    memchr(0, content).is_some()
}

/// Parse an ISO-8601 card timestamp (`YYYY-MM-DDTHH:MM:SS`, fractional
/// seconds tolerated) into a Julian-day number. Returns `None` on any
/// malformation; callers treat that as a card syntax error.
pub fn parse_card_date(z: &str) -> Option<f64> {
    let normalized = z.replacen(' ', "T", 1);
    let dt = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    let secs = dt.and_utc().timestamp() as f64 + dt.and_utc().timestamp_subsec_nanos() as f64 / 1e9;
    Some(secs / SECONDS_PER_DAY + JD_UNIX_EPOCH)
}

/// Format a UTC instant the way a D/E card spells it.
pub fn format_card_date(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Convert seconds-since-epoch to a Julian-day number.
pub fn unix_to_julian(secs: f64) -> f64 {
    secs / SECONDS_PER_DAY + JD_UNIX_EPOCH
}

/// Julian-day number for "now".
pub fn julian_now() -> f64 {
    unix_to_julian(Utc::now().timestamp() as f64)
}

/// Convert a Julian-day number back to a UTC instant (second precision).
pub fn julian_to_datetime(jd: f64) -> DateTime<Utc> {
    let secs = (jd - JD_UNIX_EPOCH) * SECONDS_PER_DAY;
    Utc.timestamp_opt(secs.round() as i64, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Escapes cover every whitespace class and round-trip.
    #[test]
    fn fossilize_round_trip() {
        let cases = [
            "plain",
            "two words",
            "tab\there",
            "line\nbreak",
            "back\\slash",
            "mixed \t\r\n\\ all",
        ];
        for z in cases {
            let enc = fossilize(z);
            assert!(!enc.contains(' '), "{enc}");
            assert_eq!(defossilize(&enc), z);
        }
    }

    /// Pathname validation rejects every escape route out of the tree.
    #[test]
    fn simple_pathname_rules() {
        assert!(is_simple_pathname("README.md"));
        assert!(is_simple_pathname("src/lib.rs"));
        assert!(is_simple_pathname("a/b/c.txt"));
        assert!(!is_simple_pathname(""));
        assert!(!is_simple_pathname("/abs"));
        assert!(!is_simple_pathname("dir/"));
        assert!(!is_simple_pathname("a//b"));
        assert!(!is_simple_pathname("./x"));
        assert!(!is_simple_pathname("a/../b"));
        assert!(!is_simple_pathname("a\\b"));
        assert!(!is_simple_pathname("ctrl\u{1}byte"));
    }

    #[test]
    fn control_artifact_sniffing() {
        assert!(looks_like_control_artifact(
            b"D 2024-01-01T00:00:00\nU alice\n"
        ));
        assert!(looks_like_control_artifact(
            b"-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA1\n"
        ));
        assert!(!looks_like_control_artifact(b"fn main() {}\n"));
        assert!(!looks_like_control_artifact(b"D missing-newline"));
        assert!(!looks_like_control_artifact(b"short"));
    }

    /// Card dates round-trip through Julian day at second precision.
    #[test]
    fn card_date_round_trip() {
        let jd = parse_card_date("2024-06-30T12:00:00").unwrap();
        let back = julian_to_datetime(jd);
        assert_eq!(format_card_date(back), "2024-06-30T12:00:00");
        assert!(parse_card_date("not a date").is_none());
    }

    #[test]
    fn binary_heuristic() {
        assert!(!looks_like_binary(b"hello text\n"));
        assert!(looks_like_binary(b"he\x00llo"));
    }
}

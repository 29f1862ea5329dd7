//! Recording filename parser.
//!
//! All knowledge of the on-disk naming scheme lives here:
//!
//! ```text
//! <service_group>_<YYYYMMDD>_<HHMMSS>_<other_party>_<call_id>[_<description words>...].<ext>
//! ```
//!
//! Parsing is pure: the same name always yields the same result, so files
//! can be reprocessed safely. Empty service-group or other-party segments are
//! recorded as absent. A name without a call id or a usable timestamp is a
//! [`ParseFailure`] and the file goes to quarantine.

use std::fmt;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Fields extracted from a recording filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub service_group: Option<String>,
    pub other_party: Option<String>,
    pub description: Option<String>,
    pub call_id: String,
    /// Filename timestamps carry no zone and are taken as UTC.
    pub recorded_at: NaiveDateTime,
}

/// Required filename segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    RecordedAt,
    CallId,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::RecordedAt => f.write_str("recorded_at"),
            Segment::CallId => f.write_str("call_id"),
        }
    }
}

/// Why a filename could not become a recording
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("missing {0} segment")]
    MissingSegment(Segment),

    #[error("malformed timestamp {0:?}")]
    MalformedTimestamp(String),
}

impl ParseFailure {
    /// Stable classification stored in the quarantine table
    pub fn reason(&self) -> &'static str {
        match self {
            ParseFailure::MissingSegment(_) => "missing_segment",
            ParseFailure::MalformedTimestamp(_) => "malformed_timestamp",
        }
    }
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8}$").expect("static regex"))
}

fn time_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{6}$").expect("static regex"))
}

/// Strip the extension (if any) from a file name.
fn stem(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    }
}

fn non_empty(segment: Option<&&str>) -> Option<String> {
    segment
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_timestamp(date: &str, time: &str) -> Result<NaiveDateTime, ParseFailure> {
    let malformed = || ParseFailure::MalformedTimestamp(format!("{}_{}", date, time));

    if !date_pattern().is_match(date) || !time_pattern().is_match(time) {
        return Err(malformed());
    }

    let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| malformed())?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S").map_err(|_| malformed())?;
    Ok(NaiveDateTime::new(date, time))
}

/// Parse a recording file name (no directory components).
pub fn parse_filename(file_name: &str) -> Result<ParsedName, ParseFailure> {
    let segments: Vec<&str> = stem(file_name).split('_').collect();

    let date = segments.get(1).map(|s| s.trim()).unwrap_or("");
    let time = segments.get(2).map(|s| s.trim()).unwrap_or("");
    if date.is_empty() || time.is_empty() {
        return Err(ParseFailure::MissingSegment(Segment::RecordedAt));
    }
    let recorded_at = parse_timestamp(date, time)?;

    let call_id = non_empty(segments.get(4))
        .ok_or(ParseFailure::MissingSegment(Segment::CallId))?;

    let description = if segments.len() > 5 {
        let words: Vec<&str> = segments[5..]
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if words.is_empty() {
            None
        } else {
            Some(words.join(" "))
        }
    } else {
        None
    };

    Ok(ParsedName {
        service_group: non_empty(segments.first()),
        other_party: non_empty(segments.get(3)),
        description,
        call_id,
        recorded_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_parse_full_name() {
        let parsed = parse_filename("svcA_20240101_120000_bob_call123.wav").unwrap();
        assert_eq!(parsed.service_group.as_deref(), Some("svcA"));
        assert_eq!(parsed.other_party.as_deref(), Some("bob"));
        assert_eq!(parsed.call_id, "call123");
        assert_eq!(parsed.description, None);
        assert_eq!(parsed.recorded_at, at(2024, 1, 1, 12, 0, 0));
    }

    #[test]
    fn test_description_words_joined() {
        let parsed =
            parse_filename("billing_20240315_093005_5551234_c-77_refund_request_escalated.mp3")
                .unwrap();
        assert_eq!(parsed.call_id, "c-77");
        assert_eq!(parsed.description.as_deref(), Some("refund request escalated"));
    }

    #[test]
    fn test_empty_optional_segments_are_absent() {
        let parsed = parse_filename("_20240101_120000__call9.wav").unwrap();
        assert_eq!(parsed.service_group, None);
        assert_eq!(parsed.other_party, None);
        assert_eq!(parsed.call_id, "call9");
    }

    #[test]
    fn test_missing_call_id_is_failure() {
        assert_eq!(
            parse_filename("svcA_20240101_120000_bob.wav"),
            Err(ParseFailure::MissingSegment(Segment::CallId))
        );
        assert_eq!(
            parse_filename("svcA_20240101_120000_bob_.wav"),
            Err(ParseFailure::MissingSegment(Segment::CallId))
        );
    }

    #[test]
    fn test_missing_timestamp_is_failure() {
        assert_eq!(
            parse_filename("svcA.wav"),
            Err(ParseFailure::MissingSegment(Segment::RecordedAt))
        );
        assert_eq!(
            parse_filename("svcA_20240101.wav"),
            Err(ParseFailure::MissingSegment(Segment::RecordedAt))
        );
    }

    #[test]
    fn test_malformed_timestamp_is_failure() {
        let err = parse_filename("svcA_20241301_120000_bob_call1.wav").unwrap_err();
        assert_eq!(err.reason(), "malformed_timestamp");

        let err = parse_filename("svcA_2024011_120000_bob_call1.wav").unwrap_err();
        assert!(matches!(err, ParseFailure::MalformedTimestamp(_)));

        let err = parse_filename("svcA_20240101_126000_bob_call1.wav").unwrap_err();
        assert!(matches!(err, ParseFailure::MalformedTimestamp(_)));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let name = "svcB_20231231_235959_carol_x1_note.ogg";
        assert_eq!(parse_filename(name), parse_filename(name));
    }

    #[test]
    fn test_name_without_extension() {
        let parsed = parse_filename("svcA_20240101_120000_bob_call123").unwrap();
        assert_eq!(parsed.call_id, "call123");
    }
}

//! Protocol timestamps
//!
//! Timestamps are fixed width, second resolution, with an explicit numeric
//! offset: `2026-10-16T09:30:00+00:00`. A trailing `Z` or fractional seconds
//! are rejected.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde_json::Value;

use crate::error::{ConformanceError, ConformanceResult};
use crate::expect;

const TIMESTAMP_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}[+-]\d{2}:\d{2}$";

fn timestamp_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(TIMESTAMP_PATTERN).expect("timestamp pattern is valid"))
}

/// Check the textual format only
pub fn is_timestamp(s: &str) -> bool {
    timestamp_regex().is_match(s)
}

/// Parse a protocol timestamp, failing on any format deviation
pub fn parse(s: &str, pointer: &str) -> ConformanceResult<DateTime<FixedOffset>> {
    if !is_timestamp(s) {
        return Err(ConformanceError::shape(
            pointer,
            "YYYY-MM-DDTHH:MM:SS+HH:MM",
            s,
        ));
    }
    DateTime::parse_from_rfc3339(s).map_err(|e| ConformanceError::shape(pointer, "a valid date", e))
}

/// Require the field at `pointer` to be a protocol timestamp
pub fn expect_timestamp(value: &Value, pointer: &str) -> ConformanceResult<DateTime<FixedOffset>> {
    parse(expect::expect_str(value, pointer)?, pointer)
}

//! Maps normalized entries to destination rows and derives the computed
//! columns: target-zone timestamp, URL token and the raw JSON copy.
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::{IngestError, IngestResult};
use crate::models::{LogShape, PersistedRow};
use crate::normalize::{FlatAccessLog, FrontDoorAccessLog, LogEntry};

lazy_static! {
    static ref PATH_SEGMENT_TOKEN: Regex = Regex::new(r"/([A-Za-z0-9]{4,12})(?:[?/]|$)").unwrap();
    static ref DUITAI_TOKEN: Regex = Regex::new(r"/DUITAI/([A-Za-z0-9]+)").unwrap();
}

/// Named token patterns. The two are not interchangeable: `Duitai` only
/// matches the segment after a literal `/DUITAI/` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenProfile {
    /// First 4-12 character alphanumeric path segment.
    #[default]
    PathSegment,
    Duitai,
}

impl FromStr for TokenProfile {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "path_segment" | "path-segment" | "generic" => Ok(TokenProfile::PathSegment),
            "duitai" => Ok(TokenProfile::Duitai),
            other => Err(IngestError::config(format!("unknown token profile {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenExtractor {
    pattern: Regex,
}

impl TokenExtractor {
    pub fn from_profile(profile: TokenProfile) -> Self {
        let pattern = match profile {
            TokenProfile::PathSegment => PATH_SEGMENT_TOKEN.clone(),
            TokenProfile::Duitai => DUITAI_TOKEN.clone(),
        };
        TokenExtractor { pattern }
    }

    /// Builds an extractor from a custom pattern. Capture group 1 is the
    /// token; a pattern without groups yields the whole match.
    pub fn from_pattern(pattern: &str) -> IngestResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| IngestError::config(format!("invalid token pattern: {}", e)))?;
        Ok(TokenExtractor { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Never fails; no input or no match is `None`.
    pub fn extract(&self, url: Option<&str>) -> Option<String> {
        let target = path_and_query(url?);
        let captures = self.pattern.captures(target)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
    }

    /// Tries each candidate URL in order and returns the first token found.
    pub fn extract_first<'a>(
        &self,
        candidates: impl IntoIterator<Item = Option<&'a str>>,
    ) -> Option<String> {
        candidates
            .into_iter()
            .find_map(|candidate| self.extract(candidate))
    }
}

impl Default for TokenExtractor {
    fn default() -> Self {
        TokenExtractor::from_profile(TokenProfile::default())
    }
}

/// Drops scheme and authority so host names are not read as path segments.
/// Protocol-relative `//host/path` references are treated the same way.
fn path_and_query(url: &str) -> &str {
    let authority = match url.find("://") {
        Some(scheme_end) if is_scheme(&url[..scheme_end]) => &url[scheme_end + 3..],
        _ => match url.strip_prefix("//") {
            Some(rest) => rest,
            None => return url,
        },
    };
    match authority.find(|c: char| c == '/' || c == '?') {
        Some(path_start) => &authority[path_start..],
        None => "",
    }
}

fn is_scheme(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Converts a UTC ISO-8601 timestamp into `zone`. A trailing `Z` or any
/// explicit offset is honoured; a string without offset is read as UTC.
pub fn convert_timestamp(raw: Option<&str>, zone: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw?.trim();
    let utc = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NAIVE_TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        })?;
    Some(utc.with_timezone(zone))
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM`, `Z` or `UTC` into a fixed offset.
pub fn parse_utc_offset(s: &str) -> IngestResult<FixedOffset> {
    let invalid = || IngestError::config(format!("invalid UTC offset {:?}", s));
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match s.chars().next() {
        Some('+') => (1, &s[1..]),
        Some('-') => (-1, &s[1..]),
        _ => return Err(invalid()),
    };
    let digits = rest.replace(':', "");
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Serializes an entry for the `raw_json` column.
pub fn serialize_raw(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

/// Owns the injected token pattern and target zone.
#[derive(Debug, Clone)]
pub struct Extractor {
    token: TokenExtractor,
    zone: FixedOffset,
}

impl Extractor {
    pub fn new(token: TokenExtractor, zone: FixedOffset) -> Self {
        Extractor { token, zone }
    }

    pub fn token(&self) -> &TokenExtractor {
        &self.token
    }

    pub fn zone(&self) -> &FixedOffset {
        &self.zone
    }

    pub fn to_row(&self, entry: &LogEntry) -> PersistedRow {
        match entry {
            LogEntry::Wrapped(log) => self.wrapped_row(log),
            LogEntry::Flat(log) => self.flat_row(log),
        }
    }

    fn wrapped_row(&self, log: &FrontDoorAccessLog) -> PersistedRow {
        PersistedRow {
            shape: LogShape::Wrapped,
            fd_time: convert_timestamp(log.time.as_deref(), &self.zone),
            client_ip: log.client_ip.clone(),
            http_method: log.http_method.clone(),
            request_uri: log.request_uri.clone(),
            user_agent: log.user_agent.clone(),
            referrer: None,
            http_status: log.http_status_code.clone(),
            cache_status: log.cache_status.clone(),
            bytes_sent: log.response_bytes,
            activity_id: log.tracking_reference.clone(),
            route_name: log.routing_rule_name.clone(),
            backend_pool: log.origin_name.clone(),
            edge_location: log.pop.clone(),
            raw_json: serialize_raw(&log.raw),
            token: self
                .token
                .extract_first([log.request_uri.as_deref(), log.origin_url.as_deref()]),
        }
    }

    fn flat_row(&self, log: &FlatAccessLog) -> PersistedRow {
        PersistedRow {
            shape: LogShape::Flat,
            fd_time: convert_timestamp(log.time.as_deref(), &self.zone),
            client_ip: log.client_ip.clone(),
            http_method: log.http_method.clone(),
            request_uri: log.request_uri.clone(),
            user_agent: log.user_agent.clone(),
            referrer: log.referrer.clone(),
            http_status: log.http_status.clone(),
            cache_status: log.cache_status.clone(),
            bytes_sent: log.sent_bytes,
            activity_id: log.activity_id.clone(),
            route_name: log.route_name.clone(),
            backend_pool: log.backend_pool_id.clone(),
            edge_location: log.edge_location_id.clone(),
            raw_json: serialize_raw(&log.raw),
            token: self
                .token
                .extract_first([log.request_uri.as_deref(), log.referrer.as_deref()]),
        }
    }
}

//! Turns decoded container records into flat access-log entries.
//!
//! Flat containers map one record to one entry. Wrapped containers carry a
//! JSON document in `Body` whose `records` array holds the entries, so one
//! container record fans out into many.
use apache_avro::types::Value;
use serde_json::Value as JsonValue;
use shared::avro::AvroValueExt;

use crate::decoder::RawContainerRecord;
use crate::error::{IngestError, IngestResult};
use crate::models::LogShape;

/// Entry from the wrapped layout. Log fields live under `properties`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontDoorAccessLog {
    pub time: Option<String>,
    pub client_ip: Option<String>,
    pub http_method: Option<String>,
    pub request_uri: Option<String>,
    pub origin_url: Option<String>,
    pub user_agent: Option<String>,
    pub http_status_code: Option<String>,
    pub cache_status: Option<String>,
    pub response_bytes: Option<i64>,
    pub tracking_reference: Option<String>,
    pub routing_rule_name: Option<String>,
    pub origin_name: Option<String>,
    pub pop: Option<String>,
    /// The whole `records[i]` element.
    pub raw: JsonValue,
}

impl FrontDoorAccessLog {
    pub fn from_json(log: JsonValue) -> Self {
        let props = log.get("properties").unwrap_or(&JsonValue::Null);
        FrontDoorAccessLog {
            time: text(&log, "time"),
            client_ip: text(props, "clientIp"),
            http_method: text(props, "httpMethod"),
            request_uri: text(props, "requestUri"),
            origin_url: text(props, "originUrl"),
            user_agent: text(props, "userAgent"),
            http_status_code: text(props, "httpStatusCode"),
            cache_status: text(props, "cacheStatus"),
            response_bytes: integer(props, "responseBytes"),
            tracking_reference: text(props, "trackingReference"),
            routing_rule_name: text(props, "routingRuleName"),
            origin_name: text(props, "originName"),
            pop: text(props, "pop"),
            raw: log,
        }
    }
}

/// Entry from the flat layout. Log fields are top-level record fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatAccessLog {
    pub time: Option<String>,
    pub client_ip: Option<String>,
    pub http_method: Option<String>,
    pub request_uri: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub http_status: Option<String>,
    pub cache_status: Option<String>,
    pub sent_bytes: Option<i64>,
    pub activity_id: Option<String>,
    pub route_name: Option<String>,
    pub backend_pool_id: Option<String>,
    pub edge_location_id: Option<String>,
    /// The whole container record, converted byte-safely.
    pub raw: JsonValue,
}

impl FlatAccessLog {
    pub fn from_json(record: JsonValue) -> Self {
        FlatAccessLog {
            time: text(&record, "time"),
            client_ip: text(&record, "clientIp"),
            http_method: text(&record, "httpMethod"),
            request_uri: text(&record, "requestUri"),
            user_agent: text(&record, "userAgent"),
            referrer: text(&record, "referrer"),
            http_status: text(&record, "httpStatus"),
            cache_status: text(&record, "cacheStatus"),
            sent_bytes: integer(&record, "sentBytes"),
            activity_id: text(&record, "activityId"),
            route_name: text(&record, "routeName"),
            backend_pool_id: text(&record, "backendPoolId"),
            edge_location_id: text(&record, "edgeLocationId"),
            raw: record,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Wrapped(FrontDoorAccessLog),
    Flat(FlatAccessLog),
}

impl LogEntry {
    pub fn raw(&self) -> &JsonValue {
        match self {
            LogEntry::Wrapped(log) => &log.raw,
            LogEntry::Flat(log) => &log.raw,
        }
    }
}

/// Expands one container record into its log entries.
///
/// Fails with `MalformedEntry` only for wrapped records whose `Body` is
/// missing, is not JSON, or has no `records` array.
pub fn normalize(record: &RawContainerRecord, shape: LogShape) -> IngestResult<Vec<LogEntry>> {
    match shape {
        LogShape::Flat => Ok(vec![LogEntry::Flat(FlatAccessLog::from_json(
            record.value.to_json_lossy(),
        ))]),
        LogShape::Wrapped => Ok(unwrap_body(&record.value)?
            .into_iter()
            .map(|log| LogEntry::Wrapped(FrontDoorAccessLog::from_json(log)))
            .collect()),
    }
}

fn unwrap_body(value: &Value) -> IngestResult<Vec<JsonValue>> {
    let body = value
        .get("Body")
        .filter(|b| !b.is_null())
        .ok_or_else(|| IngestError::malformed("record has no Body field"))?;
    let body = body
        .as_text_lossy()
        .ok_or_else(|| IngestError::malformed("Body is neither bytes nor string"))?;

    let mut document: JsonValue = serde_json::from_str(&body)
        .map_err(|e| IngestError::malformed(format!("Body is not valid JSON: {}", e)))?;

    match document.get_mut("records").map(JsonValue::take) {
        Some(JsonValue::Array(records)) => Ok(records),
        Some(_) => Err(IngestError::malformed("Body.records is not an array")),
        None => Err(IngestError::malformed("Body has no records key")),
    }
}

/// Reads `key` as text. Numbers and booleans are stringified, nested
/// values are rendered as JSON, null and absence are `None`.
fn text(obj: &JsonValue, key: &str) -> Option<String> {
    match obj.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Reads `key` as an integer, accepting numeric strings.
fn integer(obj: &JsonValue, key: &str) -> Option<i64> {
    match obj.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

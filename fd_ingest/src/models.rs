//! Project-specific model definitions
//!
use aws_lambda_events::event::s3::S3Event;
use chrono::{DateTime, FixedOffset};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::IngestResult;
use crate::pipeline::IngestSummary;

/// The two delivery layouts seen in edge access-log containers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogShape {
    /// Each container record is one log event with top-level fields.
    Flat,
    /// Each container record carries a JSON `Body` holding a `records` array.
    Wrapped,
}

impl std::fmt::Display for LogShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogShape::Flat => write!(f, "flat"),
            LogShape::Wrapped => write!(f, "wrapped"),
        }
    }
}

/// One destination row.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub shape: LogShape,
    pub fd_time: Option<DateTime<FixedOffset>>,
    pub client_ip: Option<String>,
    pub http_method: Option<String>,
    pub request_uri: Option<String>,
    pub user_agent: Option<String>,
    /// Only written by the flat layout.
    pub referrer: Option<String>,
    pub http_status: Option<String>,
    pub cache_status: Option<String>,
    pub bytes_sent: Option<i64>,
    pub activity_id: Option<String>,
    pub route_name: Option<String>,
    pub backend_pool: Option<String>,
    pub edge_location: Option<String>,
    pub raw_json: String,
    pub token: Option<String>,
}

/// Direct blob trigger: the platform names the blob and may inline its bytes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct BlobTrigger {
    pub name: String,
    /// Base64 encoded blob contents.
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TriggerEvent {
    Blob(BlobTrigger),
    S3(S3Event),
}

/// Where the bytes of one container file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IngestSource {
    Inline { name: String, content: String },
    Remote { name: String },
}

impl IngestSource {
    pub fn name(&self) -> &str {
        match self {
            IngestSource::Inline { name, .. } | IngestSource::Remote { name } => name,
        }
    }
}

impl TriggerEvent {
    pub fn into_sources(self) -> Vec<IngestSource> {
        match self {
            TriggerEvent::Blob(BlobTrigger {
                name,
                content: Some(content),
            }) => vec![IngestSource::Inline { name, content }],
            TriggerEvent::Blob(BlobTrigger {
                name,
                content: None,
            }) => vec![IngestSource::Remote { name }],
            TriggerEvent::S3(event) => event
                .records
                .into_iter()
                .filter_map(|record| {
                    let bucket = record.s3.bucket.name;
                    let key = record.s3.object.key;
                    match (bucket, key) {
                        (Some(bucket), Some(key)) => Some(IngestSource::Remote {
                            name: format!("{}/{}", bucket, decode_s3_key(&key)),
                        }),
                        _ => {
                            warn!("Skipping S3 notification record without bucket or key");
                            None
                        }
                    }
                })
                .collect(),
        }
    }
}

/// S3 notifications url-encode object keys and encode spaces as `+`.
fn decode_s3_key(key: &str) -> String {
    let plus_decoded = key.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|k| k.into_owned())
        .unwrap_or(plus_decoded)
}

#[derive(Debug, Serialize)]
pub(crate) struct FileOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<IngestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn new(name: &str, result: IngestResult<IngestSummary>) -> Self {
        let (summary, error) = match result {
            Ok(summary) => (Some(summary), None),
            Err(e) => (None, Some(e.to_string())),
        };
        FileOutcome {
            name: name.to_string(),
            summary,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SuccessResponse {
    pub req_id: String,
    pub files: Vec<FileOutcome>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FailureResponse {
    pub body: String,
}

// Implement Display for the Failure response so that we can then implement Error.
impl std::fmt::Display for FailureResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.body)
    }
}

impl std::error::Error for FailureResponse {}

/// Any aborted file fails the whole invocation so the platform can redeliver.
pub(crate) fn into_response(
    req_id: String,
    files: Vec<FileOutcome>,
) -> Result<SuccessResponse, FailureResponse> {
    let failed = files
        .iter()
        .filter_map(|f| f.error.as_ref().map(|e| format!("{}: {}", f.name, e)))
        .collect::<Vec<_>>();
    if !failed.is_empty() {
        return Err(FailureResponse {
            body: failed.join("; "),
        });
    }
    Ok(SuccessResponse { req_id, files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use serde_json::json;

    #[test]
    fn blob_trigger_with_content_is_inline() {
        let event: TriggerEvent = serde_json::from_value(json!({
            "name": "fdlogs/2024/01/01/PT1H.avro",
            "content": "AAEC"
        }))
        .unwrap();

        assert_eq!(
            event.into_sources(),
            vec![IngestSource::Inline {
                name: "fdlogs/2024/01/01/PT1H.avro".to_string(),
                content: "AAEC".to_string(),
            }]
        );
    }

    #[test]
    fn blob_trigger_without_content_is_fetched() {
        let event: TriggerEvent =
            serde_json::from_value(json!({ "name": "fdlogs/PT1H.avro" })).unwrap();

        assert_eq!(
            event.into_sources(),
            vec![IngestSource::Remote {
                name: "fdlogs/PT1H.avro".to_string()
            }]
        );
    }

    fn s3_record(bucket: &str, object: serde_json::Value) -> serde_json::Value {
        json!({
            "eventVersion": "2.1",
            "eventSource": "aws:s3",
            "awsRegion": "ap-south-1",
            "eventTime": "2024-01-01T00:05:00.000Z",
            "eventName": "ObjectCreated:Put",
            "userIdentity": { "principalId": "AWS:AIDAEXAMPLE" },
            "requestParameters": { "sourceIPAddress": "10.0.0.1" },
            "responseElements": {
                "x-amz-request-id": "C3D13FE58DE4C810",
                "x-amz-id-2": "FMyUVURIY8/IgAtTv8xRjskZQpcIZ9KG4V5Wp6S7S/JRWeUWerMUE5JgHvANOjpD"
            },
            "s3": {
                "s3SchemaVersion": "1.0",
                "configurationId": "fdlogs-created",
                "bucket": {
                    "name": bucket,
                    "ownerIdentity": { "principalId": "A3NL1KOZZKExample" },
                    "arn": format!("arn:aws:s3:::{}", bucket)
                },
                "object": object
            }
        })
    }

    #[test]
    fn s3_notifications_become_remote_sources() {
        let event: TriggerEvent = serde_json::from_value(json!({
            "Records": [
                s3_record("logs", json!({
                    "key": "a+b%2FPT1H.avro",
                    "size": 1024,
                    "eTag": "d41d8cd98f00b204e9800998ecf8427e",
                    "sequencer": "0055AED6DCD90281E5"
                })),
                s3_record("logs", json!({ "size": 0 })),
                s3_record("archive", json!({ "key": "y%3D2024/PT2H.avro" })),
            ]
        }))
        .unwrap();

        assert!(matches!(event, TriggerEvent::S3(_)));
        assert_eq!(
            event.into_sources(),
            vec![
                IngestSource::Remote {
                    name: "logs/a b/PT1H.avro".to_string()
                },
                IngestSource::Remote {
                    name: "archive/y=2024/PT2H.avro".to_string()
                },
            ]
        );
    }

    fn summary() -> IngestSummary {
        IngestSummary {
            rows_committed: 3,
            committed: true,
            ..Default::default()
        }
    }

    #[test]
    fn any_aborted_file_fails_the_invocation() {
        let files = vec![
            FileOutcome::new("logs/ok.avro", Ok(summary())),
            FileOutcome::new(
                "logs/bad.avro",
                Err(IngestError::decode("invalid container header")),
            ),
        ];

        let failure = into_response("req-1".to_string(), files).unwrap_err();
        assert_eq!(
            failure.to_string(),
            "logs/bad.avro: decode error: invalid container header"
        );
    }

    #[test]
    fn all_successful_files_are_reported() {
        let files = vec![
            FileOutcome::new("logs/a.avro", Ok(summary())),
            FileOutcome::new("logs/b.avro", Ok(IngestSummary::default())),
        ];

        let response = into_response("req-2".to_string(), files).unwrap();
        assert_eq!(response.req_id, "req-2");
        assert_eq!(response.files.len(), 2);
        assert_eq!(response.files[0].summary, Some(summary()));
        assert!(response.files.iter().all(|f| f.error.is_none()));
    }

    #[test]
    fn s3_keys_are_url_decoded() {
        assert_eq!(decode_s3_key("logs/a+b%2Fc.avro"), "logs/a b/c.avro");
        assert_eq!(decode_s3_key("plain.avro"), "plain.avro");
    }
}

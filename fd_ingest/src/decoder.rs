use apache_avro::types::Value;
use apache_avro::{Reader, Schema};
use log::debug;

use crate::error::{IngestError, IngestResult};
use crate::models::LogShape;

/// One record read from the container, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContainerRecord {
    pub index: usize,
    pub value: Value,
}

#[derive(Debug)]
pub struct DecodedContainer {
    pub shape: LogShape,
    pub records: Vec<RawContainerRecord>,
}

/// Reads every record of an Avro object container into memory.
///
/// A bad header, a corrupt block or a truncated file fails the whole
/// container; nothing is returned partially. `declared` overrides the shape
/// detected from the writer schema.
pub fn decode(bytes: &[u8], declared: Option<LogShape>) -> IngestResult<DecodedContainer> {
    let reader = Reader::new(bytes)
        .map_err(|e| IngestError::decode(format!("invalid container header: {}", e)))?;

    let detected = detect_shape(reader.writer_schema());
    let shape = declared.unwrap_or(detected);
    if shape != detected {
        debug!("Declared shape {} overrides detected shape {}", shape, detected);
    }

    let records = reader
        .enumerate()
        .map(|(index, value)| {
            value
                .map(|value| RawContainerRecord { index, value })
                .map_err(|e| IngestError::decode(format!("record {}: {}", index, e)))
        })
        .collect::<IngestResult<Vec<_>>>()?;

    Ok(DecodedContainer { shape, records })
}

/// A container whose top-level record has a `Body` field is wrapped.
pub fn detect_shape(schema: &Schema) -> LogShape {
    let schema_json = serde_json::to_value(schema).unwrap_or_default();
    let has_body = schema_json
        .get("fields")
        .and_then(|fields| fields.as_array())
        .map_or(false, |fields| {
            fields
                .iter()
                .any(|f| f.get("name").and_then(|n| n.as_str()) == Some("Body"))
        });
    if has_body {
        LogShape::Wrapped
    } else {
        LogShape::Flat
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use shared::avro::AvroValueExt;

    #[test]
    fn decodes_capture_container_as_wrapped() {
        let bytes = capture_container(&[&wrapped_body(1), &wrapped_body(2)]);

        let decoded = decode(&bytes, None).unwrap();
        assert_eq!(decoded.shape, LogShape::Wrapped);
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[1].index, 1);
        assert!(decoded.records[0].value.get("Body").is_some());
    }

    #[test]
    fn decodes_flat_container_as_flat() {
        let bytes = flat_container(&["/a", "/b", "/c"]);

        let decoded = decode(&bytes, None).unwrap();
        assert_eq!(decoded.shape, LogShape::Flat);
        assert_eq!(decoded.records.len(), 3);
        assert_eq!(
            decoded.records[2].value.get("requestUri").and_then(|v| v.as_str()),
            Some("/c")
        );
    }

    #[test]
    fn declared_shape_wins() {
        let bytes = flat_container(&["/a"]);
        let decoded = decode(&bytes, Some(LogShape::Wrapped)).unwrap();
        assert_eq!(decoded.shape, LogShape::Wrapped);
    }

    #[test]
    fn empty_container_decodes_to_no_records() {
        let decoded = decode(&capture_container(&[]), None).unwrap();
        assert_eq!(decoded.shape, LogShape::Wrapped);
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn garbage_fails_to_decode() {
        match decode(b"definitely not avro", None) {
            Err(IngestError::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other),
        }
        assert!(decode(&[], None).is_err());
    }

    #[test]
    fn truncated_container_fails_to_decode() {
        let bytes = capture_container(&[&wrapped_body(3)]);
        let truncated = &bytes[..bytes.len() - 5];

        match decode(truncated, None) {
            Err(IngestError::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other),
        }
    }
}

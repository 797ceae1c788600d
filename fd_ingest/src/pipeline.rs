use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info};
use serde::Serialize;
use shared::avro::AvroValueExt;
use shared::{truncate_for_log, ObjectLocation};

use crate::config::IngestConfig;
use crate::decoder::{decode, RawContainerRecord};
use crate::error::{IngestError, IngestResult};
use crate::fetch::ObjectFetcher;
use crate::models::{IngestSource, LogShape};
use crate::normalize::normalize;
use crate::writer::{LogStore, RowContext, RowWriter, MAX_LOGGED_ENTRY_CHARS};

/// What one container file produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub shape: Option<LogShape>,
    pub records_decoded: usize,
    pub malformed_records: usize,
    pub entries: usize,
    pub rows_inserted: usize,
    pub rows_failed: usize,
    pub rows_committed: usize,
    /// False when a commit failed; rows after the last good commit are lost.
    pub committed: bool,
}

/// Runs one container through decode, normalize, extract and write.
///
/// Fatal errors (decode, connection) are returned. Malformed records and
/// rejected rows are logged and counted, and the run carries on.
pub async fn ingest_bytes(
    config: &IngestConfig,
    store: &dyn LogStore,
    name: &str,
    bytes: &[u8],
) -> IngestResult<IngestSummary> {
    let start = Instant::now();
    info!("Processing blob: {} ({} bytes)", name, bytes.len());

    let container = decode(bytes, config.declared_shape).map_err(|e| {
        error!("Could not decode {}: {}", name, e);
        e
    })?;
    let mut summary = IngestSummary {
        shape: Some(container.shape),
        records_decoded: container.records.len(),
        committed: true,
        ..Default::default()
    };
    info!(
        "Decoded {} {} records from {}",
        summary.records_decoded, container.shape, name
    );

    if container.records.is_empty() {
        info!("Nothing to ingest from {}", name);
        return Ok(summary);
    }

    let mut writer = RowWriter::open(store, config.commit_mode)
        .await
        .map_err(|e| {
            error!("Could not connect to the destination store: {}", e);
            e
        })?;

    for record in &container.records {
        let entries = match normalize(record, container.shape) {
            Ok(entries) => entries,
            Err(e) => {
                summary.malformed_records += 1;
                error!("{}", malformed_record_message(name, record, &e));
                continue;
            }
        };
        debug!("Record {} of {} holds {} entries", record.index, name, entries.len());

        for (entry_index, entry) in entries.iter().enumerate() {
            summary.entries += 1;
            let row = config.extractor.to_row(entry);
            let ctx = RowContext {
                file: name,
                record_index: record.index,
                entry_index,
            };
            writer.write(&row, ctx).await;
        }
        writer.end_record(name, record.index).await;
    }

    let (stats, report) = writer.finish(name).await;
    summary.rows_inserted = stats.rows_inserted;
    summary.rows_failed = stats.rows_failed;
    summary.rows_committed = stats.rows_committed;
    summary.committed = stats.failed_commits == 0;
    if let Err(e) = report.close {
        debug!("Ignoring close failure for {}: {}", name, e);
    }

    info!(
        "Ingested {} rows from {} ({} failed, {} malformed records) in {:.2?}",
        summary.rows_committed,
        name,
        summary.rows_failed,
        summary.malformed_records,
        start.elapsed()
    );
    Ok(summary)
}

fn malformed_record_message(name: &str, record: &RawContainerRecord, e: &IngestError) -> String {
    format!(
        "Skipping record {} of {}: {}. Record: {}",
        record.index,
        name,
        e,
        truncate_for_log(&record.value.to_json_lossy().to_string(), MAX_LOGGED_ENTRY_CHARS)
    )
}

/// Resolves the bytes of one source, inline or fetched.
pub async fn load_bytes(
    source: &IngestSource,
    fetcher: Option<&dyn ObjectFetcher>,
) -> IngestResult<Bytes> {
    match source {
        IngestSource::Inline { name, content } => base64::decode(content.trim())
            .map(Bytes::from)
            .map_err(|e| IngestError::fetch(format!("{}: inline content is not base64: {}", name, e))),
        IngestSource::Remote { name } => {
            let location = ObjectLocation::parse(name).map_err(|e| IngestError::fetch(e.to_string()))?;
            let fetcher = fetcher.ok_or_else(|| {
                IngestError::config(format!(
                    "{} must be fetched but FDLOGS_STORAGE_CONN is not set",
                    location
                ))
            })?;
            fetcher.fetch(&location).await
        }
    }
}

pub async fn ingest_source(
    config: &IngestConfig,
    store: &dyn LogStore,
    fetcher: Option<&dyn ObjectFetcher>,
    source: &IngestSource,
) -> IngestResult<IngestSummary> {
    let bytes = load_bytes(source, fetcher).await?;
    ingest_bytes(config, store, source.name(), &bytes).await
}

use std::str::FromStr;

use async_trait::async_trait;
use log::{error, info};
use serde::Serialize;
use shared::truncate_for_log;

use crate::error::{IngestError, IngestResult};
use crate::models::PersistedRow;

/// Longest raw entry echoed into an error line.
pub(crate) const MAX_LOGGED_ENTRY_CHARS: usize = 2048;

/// Opens sessions against the destination table.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn connect(&self) -> IngestResult<Box<dyn LogSession>>;
}

/// One open connection. Rows become visible only after `commit`.
#[async_trait]
pub trait LogSession: Send {
    async fn insert(&mut self, row: &PersistedRow) -> IngestResult<()>;
    async fn commit(&mut self) -> IngestResult<()>;
    async fn close(self: Box<Self>) -> IngestResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// One commit after the whole file.
    #[default]
    Batch,
    /// Commit after the entries of each container record.
    PerRecord,
}

impl FromStr for CommitMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batch" => Ok(CommitMode::Batch),
            "per_record" | "per-record" => Ok(CommitMode::PerRecord),
            other => Err(IngestError::config(format!("unknown commit mode {:?}", other))),
        }
    }
}

/// Identifies a row in log lines.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub file: &'a str,
    pub record_index: usize,
    pub entry_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub rows_inserted: usize,
    pub rows_failed: usize,
    pub rows_committed: usize,
    pub failed_commits: usize,
}

/// Outcome of the two shutdown steps, kept apart so neither hides the other.
#[derive(Debug)]
pub struct ShutdownReport {
    pub commit: Option<IngestResult<()>>,
    pub close: IngestResult<()>,
}

/// Drives one session for one file: isolates row failures, commits by
/// `CommitMode`, and shuts down in two independent phases.
pub struct RowWriter {
    session: Box<dyn LogSession>,
    mode: CommitMode,
    pending: usize,
    stats: WriteStats,
}

impl RowWriter {
    pub async fn open(store: &dyn LogStore, mode: CommitMode) -> IngestResult<Self> {
        let session = store.connect().await?;
        Ok(RowWriter {
            session,
            mode,
            pending: 0,
            stats: WriteStats::default(),
        })
    }

    /// Inserts one row. A failure is logged and counted, never returned.
    pub async fn write(&mut self, row: &PersistedRow, ctx: RowContext<'_>) -> bool {
        match self.session.insert(row).await {
            Ok(()) => {
                self.pending += 1;
                self.stats.rows_inserted += 1;
                true
            }
            Err(e) => {
                self.stats.rows_failed += 1;
                error!(
                    "Failed to insert entry {} of record {} from {}: {}. Entry: {}",
                    ctx.entry_index,
                    ctx.record_index,
                    ctx.file,
                    e,
                    truncate_for_log(&row.raw_json, MAX_LOGGED_ENTRY_CHARS)
                );
                false
            }
        }
    }

    /// Marks the end of one container record's entries.
    pub async fn end_record(&mut self, file: &str, record_index: usize) {
        if self.mode == CommitMode::PerRecord && self.pending > 0 {
            if let Err(e) = self.commit().await {
                error!(
                    "Failed to commit rows of record {} from {}: {}",
                    record_index, file, e
                );
            }
        }
    }

    async fn commit(&mut self) -> IngestResult<()> {
        let pending = std::mem::take(&mut self.pending);
        match self.session.commit().await {
            Ok(()) => {
                self.stats.rows_committed += pending;
                Ok(())
            }
            Err(e) => {
                self.stats.failed_commits += 1;
                Err(e)
            }
        }
    }

    /// Commits what is pending, then closes the session whatever the commit did.
    pub async fn finish(mut self, file: &str) -> (WriteStats, ShutdownReport) {
        let commit = match self.mode {
            CommitMode::PerRecord if self.pending == 0 => None,
            _ => Some(self.commit().await),
        };
        match &commit {
            Some(Ok(())) => info!("Committed {} rows from {}", self.stats.rows_committed, file),
            Some(Err(e)) => error!("Commit failed for {}: {}", file, e),
            None => {}
        }

        let close = self.session.close().await;
        if let Err(e) = &close {
            error!("Closing the destination session for {} failed: {}", file, e);
        }

        (self.stats, ShutdownReport { commit, close })
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::models::LogShape;

    fn row(uri: &str) -> PersistedRow {
        PersistedRow {
            shape: LogShape::Wrapped,
            fd_time: None,
            client_ip: None,
            http_method: None,
            request_uri: Some(uri.to_string()),
            user_agent: None,
            referrer: None,
            http_status: None,
            cache_status: None,
            bytes_sent: None,
            activity_id: None,
            route_name: None,
            backend_pool: None,
            edge_location: None,
            raw_json: "{}".to_string(),
            token: None,
        }
    }

    fn ctx(entry_index: usize) -> RowContext<'static> {
        RowContext {
            file: "fdlogs/PT1H.avro",
            record_index: 0,
            entry_index,
        }
    }

    #[tokio::test]
    async fn failed_rows_are_skipped_and_the_rest_commit() {
        let mut store = MemoryStore::default();
        store.reject_uris.insert("/bad".to_string());

        let mut writer = RowWriter::open(&store, CommitMode::Batch).await.unwrap();
        assert!(writer.write(&row("/a"), ctx(0)).await);
        assert!(!writer.write(&row("/bad"), ctx(1)).await);
        assert!(writer.write(&row("/b"), ctx(2)).await);
        writer.end_record("fdlogs/PT1H.avro", 0).await;

        let (stats, report) = writer.finish("fdlogs/PT1H.avro").await;
        assert!(matches!(report.commit, Some(Ok(()))));
        assert!(report.close.is_ok());
        assert_eq!(
            stats,
            WriteStats {
                rows_inserted: 2,
                rows_failed: 1,
                rows_committed: 2,
                failed_commits: 0,
            }
        );
        assert_eq!(store.committed().len(), 2);
        assert_eq!(store.state.lock().unwrap().commits, 1);
    }

    #[tokio::test]
    async fn per_record_mode_commits_after_each_record() {
        let store = MemoryStore::default();

        let mut writer = RowWriter::open(&store, CommitMode::PerRecord).await.unwrap();
        writer.write(&row("/a"), ctx(0)).await;
        writer.end_record("f", 0).await;
        writer.end_record("f", 1).await;
        writer.write(&row("/b"), ctx(0)).await;
        writer.end_record("f", 2).await;

        let (stats, report) = writer.finish("f").await;
        assert!(report.commit.is_none());
        assert_eq!(stats.rows_committed, 2);
        assert_eq!(store.state.lock().unwrap().commits, 2);
    }

    #[tokio::test]
    async fn close_runs_even_when_commit_fails() {
        let store = MemoryStore {
            fail_commit: true,
            fail_close: true,
            ..Default::default()
        };

        let mut writer = RowWriter::open(&store, CommitMode::Batch).await.unwrap();
        writer.write(&row("/a"), ctx(0)).await;

        let (stats, report) = writer.finish("f").await;
        assert!(matches!(report.commit, Some(Err(IngestError::Commit(_)))));
        assert!(matches!(report.close, Err(IngestError::Close(_))));
        assert_eq!(stats.rows_committed, 0);
        assert_eq!(stats.failed_commits, 1);
        assert_eq!(store.state.lock().unwrap().closes, 1);
        assert!(store.committed().is_empty());
    }

    #[tokio::test]
    async fn open_surfaces_connection_errors() {
        let store = MemoryStore {
            fail_connect: true,
            ..Default::default()
        };
        match RowWriter::open(&store, CommitMode::Batch).await {
            Err(IngestError::Connection(_)) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[test]
    fn commit_modes_parse() {
        assert_eq!("batch".parse::<CommitMode>().unwrap(), CommitMode::Batch);
        assert_eq!("PER_RECORD".parse::<CommitMode>().unwrap(), CommitMode::PerRecord);
        assert!("sometimes".parse::<CommitMode>().is_err());
    }
}

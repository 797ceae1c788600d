use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

/// Failures of one ingest run, grouped by how far they reach.
///
/// `Config`, `Fetch`, `Decode` and `Connection` abort the file.
/// `MalformedEntry` skips one container record, `Insert` skips one row.
/// `Commit` and `Close` are logged at shutdown and never abort.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("malformed entry: {0}")]
    MalformedEntry(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("insert error: {0}")]
    Insert(String),
    #[error("commit error: {0}")]
    Commit(String),
    #[error("close error: {0}")]
    Close(String),
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEntry(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn insert(message: impl Into<String>) -> Self {
        Self::Insert(message.into())
    }

    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit(message.into())
    }

    pub fn close(message: impl Into<String>) -> Self {
        Self::Close(message.into())
    }

    /// Whether this error ends processing of the whole file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Fetch(_) | Self::Decode(_) | Self::Connection(_)
        )
    }
}

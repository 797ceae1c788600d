//! Process configuration.
//!
//! Read from the environment once at startup and validated into an
//! `IngestConfig` that is handed to the pipeline.
use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{IngestError, IngestResult};
use crate::extract::{parse_utc_offset, Extractor, TokenExtractor, TokenProfile};
use crate::models::LogShape;
use crate::postgres::{TableName, TableNames};
use crate::writer::CommitMode;

const DEFAULT_TARGET_UTC_OFFSET: &str = "+05:30";
const DEFAULT_WRAPPED_TABLE: &str = "fd_logs";
const DEFAULT_FLAT_TABLE: &str = "dbo.FD_RawLogs";

/// Raw settings as found in the environment.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(alias = "SQL_CONN_STR")]
    pub sql_conn_str: Option<String>,
    #[serde(alias = "FDLOGS_STORAGE_CONN")]
    pub fdlogs_storage_conn: Option<String>,
    #[serde(alias = "TOKEN_PROFILE")]
    pub token_profile: Option<String>,
    #[serde(alias = "TOKEN_PATTERN")]
    pub token_pattern: Option<String>,
    #[serde(alias = "TARGET_UTC_OFFSET")]
    pub target_utc_offset: Option<String>,
    #[serde(alias = "LOG_SHAPE")]
    pub log_shape: Option<String>,
    #[serde(alias = "COMMIT_MODE")]
    pub commit_mode: Option<String>,
    #[serde(alias = "WRAPPED_TABLE")]
    pub wrapped_table: Option<String>,
    #[serde(alias = "FLAT_TABLE")]
    pub flat_table: Option<String>,
}

impl Settings {
    pub fn from_env() -> IngestResult<Self> {
        let config = Config::builder()
            .add_source(Environment::default())
            .build()
            .map_err(|e| IngestError::config(e.to_string()))?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> IngestResult<Self> {
        config
            .try_deserialize()
            .map_err(|e| IngestError::config(e.to_string()))
    }
}

/// Everything one ingest run needs to know.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub sql_connection: String,
    /// Only needed when a trigger does not carry the blob contents.
    pub storage_connection: Option<String>,
    pub extractor: Extractor,
    /// `None` means detect per container.
    pub declared_shape: Option<LogShape>,
    pub commit_mode: CommitMode,
    pub tables: TableNames,
}

impl IngestConfig {
    pub fn from_env() -> IngestResult<Self> {
        Self::from_settings(Settings::from_env()?)
    }

    pub fn from_settings(settings: Settings) -> IngestResult<Self> {
        let sql_connection = non_empty(settings.sql_conn_str)
            .ok_or_else(|| IngestError::config("SQL_CONN_STR is required"))?;
        let storage_connection = non_empty(settings.fdlogs_storage_conn);

        let token = match non_empty(settings.token_pattern) {
            Some(pattern) => TokenExtractor::from_pattern(&pattern)?,
            None => TokenExtractor::from_profile(
                non_empty(settings.token_profile)
                    .map(|p| p.parse::<TokenProfile>())
                    .transpose()?
                    .unwrap_or_default(),
            ),
        };
        let zone = parse_utc_offset(
            non_empty(settings.target_utc_offset)
                .as_deref()
                .unwrap_or(DEFAULT_TARGET_UTC_OFFSET),
        )?;

        let declared_shape = match non_empty(settings.log_shape).map(|s| s.to_lowercase()) {
            None => None,
            Some(s) if s == "auto" => None,
            Some(s) if s == "flat" => Some(LogShape::Flat),
            Some(s) if s == "wrapped" => Some(LogShape::Wrapped),
            Some(other) => {
                return Err(IngestError::config(format!("unknown log shape {:?}", other)))
            }
        };
        let commit_mode = non_empty(settings.commit_mode)
            .map(|m| m.parse::<CommitMode>())
            .transpose()?
            .unwrap_or_default();

        let tables = TableNames {
            wrapped: TableName::parse(
                non_empty(settings.wrapped_table)
                    .as_deref()
                    .unwrap_or(DEFAULT_WRAPPED_TABLE),
            )?,
            flat: TableName::parse(
                non_empty(settings.flat_table)
                    .as_deref()
                    .unwrap_or(DEFAULT_FLAT_TABLE),
            )?,
        };

        Ok(IngestConfig {
            sql_connection,
            storage_connection,
            extractor: Extractor::new(token, zone),
            declared_shape,
            commit_mode,
            tables,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> IngestResult<IngestConfig> {
        let mut builder = Config::builder();
        for (k, v) in pairs {
            builder = builder.set_override(*k, *v).unwrap();
        }
        IngestConfig::from_settings(Settings::from_config(builder.build().unwrap())?)
    }

    #[test]
    fn defaults_apply_when_only_the_store_is_configured() {
        let config = settings(&[("sql_conn_str", "host=db user=ingest")]).unwrap();

        assert_eq!(config.sql_connection, "host=db user=ingest");
        assert_eq!(config.storage_connection, None);
        assert_eq!(config.declared_shape, None);
        assert_eq!(config.commit_mode, CommitMode::Batch);
        assert_eq!(config.extractor.zone().local_minus_utc(), 19800);
        assert_eq!(
            config.extractor.token().as_str(),
            TokenExtractor::from_profile(TokenProfile::PathSegment).as_str()
        );
        assert_eq!(config.tables.wrapped.to_string(), "fd_logs");
        assert_eq!(config.tables.flat.to_string(), "dbo.FD_RawLogs");
    }

    #[test]
    fn missing_store_connection_is_fatal() {
        match settings(&[("fdlogs_storage_conn", "http://minio:9000")]) {
            Err(IngestError::Config(msg)) => assert!(msg.contains("SQL_CONN_STR")),
            other => panic!("expected config error, got {:?}", other),
        }
        assert!(settings(&[("sql_conn_str", "  ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = settings(&[
            ("sql_conn_str", "host=db"),
            ("fdlogs_storage_conn", "http://minio:9000"),
            ("token_profile", "duitai"),
            ("target_utc_offset", "-03:00"),
            ("log_shape", "Flat"),
            ("commit_mode", "per_record"),
            ("flat_table", "public.raw_logs"),
        ])
        .unwrap();

        assert_eq!(config.storage_connection.as_deref(), Some("http://minio:9000"));
        assert_eq!(
            config.extractor.token().as_str(),
            TokenExtractor::from_profile(TokenProfile::Duitai).as_str()
        );
        assert_eq!(config.extractor.zone().local_minus_utc(), -10800);
        assert_eq!(config.declared_shape, Some(LogShape::Flat));
        assert_eq!(config.commit_mode, CommitMode::PerRecord);
        assert_eq!(config.tables.flat.to_string(), "public.raw_logs");
    }

    #[test]
    fn custom_pattern_beats_profile() {
        let config = settings(&[
            ("sql_conn_str", "host=db"),
            ("token_profile", "duitai"),
            ("token_pattern", r"/t/(\d+)"),
        ])
        .unwrap();
        assert_eq!(config.extractor.token().as_str(), r"/t/(\d+)");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("token_pattern", "(oops"),
            ("token_profile", "fuzzy"),
            ("target_utc_offset", "IST"),
            ("log_shape", "nested"),
            ("commit_mode", "never"),
            ("wrapped_table", "logs;drop"),
        ] {
            assert!(
                settings(&[("sql_conn_str", "host=db"), (key, value)]).is_err(),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }
}

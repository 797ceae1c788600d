//! Destination store backed by `tokio-postgres`.
//!
//! Each session keeps one open transaction. Inserts run inside a savepoint
//! so a rejected row is rolled back on its own and the transaction stays
//! usable for the rows after it.
use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, error};
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Statement};

use crate::error::{IngestError, IngestResult};
use crate::models::{LogShape, PersistedRow};
use crate::writer::{LogSession, LogStore};

/// Destination columns and the SQL types the bound parameters require.
const WRAPPED_COLUMNS: [(&str, &str); 14] = [
    ("fd_time", "TIMESTAMP"),
    ("client_ip", "TEXT"),
    ("http_method", "TEXT"),
    ("request_uri", "TEXT"),
    ("user_agent", "TEXT"),
    ("http_status", "TEXT"),
    ("cache_status", "TEXT"),
    ("bytes_sent", "BIGINT"),
    ("activity_id", "TEXT"),
    ("route_name", "TEXT"),
    ("backend_pool", "TEXT"),
    ("edge_location", "TEXT"),
    ("raw_json", "TEXT"),
    ("token", "TEXT"),
];

const FLAT_COLUMNS: [(&str, &str); 15] = [
    ("fd_time", "TIMESTAMP"),
    ("client_ip", "TEXT"),
    ("http_method", "TEXT"),
    ("request_uri", "TEXT"),
    ("user_agent", "TEXT"),
    ("referrer", "TEXT"),
    ("http_status", "TEXT"),
    ("cache_status", "TEXT"),
    ("bytes_sent", "BIGINT"),
    ("activity_id", "TEXT"),
    ("route_name", "TEXT"),
    ("backend_pool", "TEXT"),
    ("edge_location", "TEXT"),
    ("raw_json", "TEXT"),
    ("token", "TEXT"),
];

fn columns(shape: LogShape) -> &'static [(&'static str, &'static str)] {
    match shape {
        LogShape::Wrapped => &WRAPPED_COLUMNS,
        LogShape::Flat => &FLAT_COLUMNS,
    }
}

/// Optionally schema-qualified table name, e.g. `dbo.FD_RawLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    table: String,
}

impl TableName {
    pub fn parse(name: &str) -> IngestResult<Self> {
        let name = name.trim();
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (Some(schema.to_string()), table.to_string()),
            None => (None, name.to_string()),
        };
        let valid = |ident: &str| {
            !ident.is_empty()
                && ident
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        };
        if !valid(table.as_str()) || !schema.as_deref().map_or(true, valid) {
            return Err(IngestError::config(format!("invalid table name {:?}", name)));
        }
        Ok(TableName { schema, table })
    }

    /// Table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// Destination tables per log shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub wrapped: TableName,
    pub flat: TableName,
}

impl TableNames {
    pub fn for_shape(&self, shape: LogShape) -> &TableName {
        match shape {
            LogShape::Wrapped => &self.wrapped,
            LogShape::Flat => &self.flat,
        }
    }
}

/// The parameterized insert for one shape.
///
/// Parameters are bound as `NaiveDateTime` (civil time in the target zone),
/// `i64` and `String`, so the table must use `TIMESTAMP` (without time zone),
/// `BIGINT` and text columns. `create_table_statement` renders that layout;
/// a table with e.g. an integer `http_status` rejects every row.
pub fn insert_statement(table: &TableName, shape: LogShape) -> String {
    let columns = columns(shape);
    let names = columns.iter().map(|(name, _)| *name).collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.qualified(),
        names.join(", "),
        placeholders
    )
}

/// DDL for a destination table the inserts bind against.
pub fn create_table_statement(table: &TableName, shape: LogShape) -> String {
    let columns = columns(shape)
        .iter()
        .map(|(name, sql_type)| format!("{} {}", name, sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table.qualified(), columns)
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    connection_string: String,
    tables: TableNames,
}

impl PostgresStore {
    pub fn new(connection_string: impl Into<String>, tables: TableNames) -> Self {
        PostgresStore {
            connection_string: connection_string.into(),
            tables,
        }
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn connect(&self) -> IngestResult<Box<dyn LogSession>> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| IngestError::connection(e.to_string()))?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Destination connection error: {}", e);
            }
        });

        Ok(Box::new(PostgresSession {
            client,
            connection,
            tables: self.tables.clone(),
            statements: HashMap::new(),
            in_transaction: false,
        }))
    }
}

struct PostgresSession {
    client: Client,
    connection: JoinHandle<()>,
    tables: TableNames,
    statements: HashMap<LogShape, Statement>,
    in_transaction: bool,
}

impl PostgresSession {
    async fn statement(&mut self, shape: LogShape) -> Result<Statement, tokio_postgres::Error> {
        if let Some(statement) = self.statements.get(&shape) {
            return Ok(statement.clone());
        }
        let table = self.tables.for_shape(shape);
        let sql = insert_statement(table, shape);
        debug!(
            "Preparing insert: {} (expects {})",
            sql,
            create_table_statement(table, shape)
        );
        let statement = self.client.prepare(&sql).await?;
        self.statements.insert(shape, statement.clone());
        Ok(statement)
    }

    async fn execute_insert(&mut self, row: &PersistedRow) -> Result<u64, tokio_postgres::Error> {
        let statement = self.statement(row.shape).await?;
        // Stored as the civil time of the target zone.
        let fd_time = row.fd_time.map(|t| t.naive_local());

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(FLAT_COLUMNS.len());
        params.push(&fd_time);
        params.push(&row.client_ip);
        params.push(&row.http_method);
        params.push(&row.request_uri);
        params.push(&row.user_agent);
        if row.shape == LogShape::Flat {
            params.push(&row.referrer);
        }
        params.push(&row.http_status);
        params.push(&row.cache_status);
        params.push(&row.bytes_sent);
        params.push(&row.activity_id);
        params.push(&row.route_name);
        params.push(&row.backend_pool);
        params.push(&row.edge_location);
        params.push(&row.raw_json);
        params.push(&row.token);

        self.client.execute(&statement, &params).await
    }
}

#[async_trait]
impl LogSession for PostgresSession {
    async fn insert(&mut self, row: &PersistedRow) -> IngestResult<()> {
        if !self.in_transaction {
            self.client
                .batch_execute("BEGIN")
                .await
                .map_err(|e| IngestError::insert(format!("could not begin transaction: {}", e)))?;
            self.in_transaction = true;
        }

        self.client
            .batch_execute("SAVEPOINT fd_row")
            .await
            .map_err(|e| IngestError::insert(e.to_string()))?;

        match self.execute_insert(row).await {
            Ok(_) => self
                .client
                .batch_execute("RELEASE SAVEPOINT fd_row")
                .await
                .map_err(|e| IngestError::insert(e.to_string())),
            Err(e) => {
                if let Err(rollback) = self
                    .client
                    .batch_execute("ROLLBACK TO SAVEPOINT fd_row")
                    .await
                {
                    error!("Rolling back a failed insert also failed: {}", rollback);
                }
                Err(IngestError::insert(e.to_string()))
            }
        }
    }

    async fn commit(&mut self) -> IngestResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| IngestError::commit(e.to_string()))
    }

    async fn close(self: Box<Self>) -> IngestResult<()> {
        let PostgresSession {
            client,
            connection,
            in_transaction,
            ..
        } = *self;
        if in_transaction {
            debug!("Closing with an open transaction; uncommitted rows are discarded");
        }
        // Dropping the client ends the connection task.
        drop(client);
        connection
            .await
            .map_err(|e| IngestError::close(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> TableNames {
        TableNames {
            wrapped: TableName::parse("fd_logs").unwrap(),
            flat: TableName::parse("dbo.FD_RawLogs").unwrap(),
        }
    }

    #[test]
    fn wrapped_insert_has_fourteen_parameters() {
        let tables = tables();
        let sql = insert_statement(tables.for_shape(LogShape::Wrapped), LogShape::Wrapped);
        assert!(sql.starts_with("INSERT INTO \"fd_logs\" (fd_time, client_ip,"));
        assert!(sql.ends_with("$13, $14)"));
        assert!(!sql.contains("referrer"));
    }

    #[test]
    fn flat_insert_adds_referrer() {
        let tables = tables();
        let sql = insert_statement(tables.for_shape(LogShape::Flat), LogShape::Flat);
        assert!(sql.starts_with("INSERT INTO \"dbo\".\"FD_RawLogs\" ("));
        assert!(sql.contains("user_agent, referrer, http_status"));
        assert!(sql.ends_with("$14, $15)"));
    }

    #[test]
    fn parameter_types_are_pinned_in_the_ddl() {
        let tables = tables();
        let ddl = create_table_statement(tables.for_shape(LogShape::Flat), LogShape::Flat);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"dbo\".\"FD_RawLogs\" (fd_time TIMESTAMP,"));
        assert!(ddl.contains("referrer TEXT, http_status TEXT"));
        assert!(ddl.contains("bytes_sent BIGINT"));

        for shape in [LogShape::Wrapped, LogShape::Flat] {
            let ddl = create_table_statement(tables.for_shape(shape), shape);
            let insert = insert_statement(tables.for_shape(shape), shape);
            let declared = columns(shape).iter().map(|(name, _)| *name).collect::<Vec<_>>();
            assert!(insert.contains(&format!("({})", declared.join(", "))));
            assert_eq!(ddl.matches(',').count() + 1, declared.len());
        }
    }

    #[test]
    fn table_names_reject_injection() {
        assert!(TableName::parse("fd_logs; DROP TABLE x").is_err());
        assert!(TableName::parse("a.b.c").is_err());
        assert!(TableName::parse("").is_err());
        assert!(TableName::parse(".logs").is_err());
        assert_eq!(TableName::parse(" dbo.FD_RawLogs ").unwrap().to_string(), "dbo.FD_RawLogs");
    }
}

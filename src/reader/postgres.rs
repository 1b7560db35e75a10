//! PostgreSQL backend implementation
//!
//! The row-store variant. A client is connected for each call and dropped afterwards;
//! pooling, if wanted, belongs in front of this reader. Results are fetched through a
//! server-side cursor in batches, so large exports never sit in memory at once.
//!
//! All cells come back in their text representation (simple query protocol) and are
//! handed on as [`Value::Text`]; consumers use the parsing accessors on [`Value`].

use postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::debug;

use crate::column::{Columns, SemanticType};
use crate::reader::{classify_catalog, Dialect, Reader};
use crate::value::{RowSink, Value};
use crate::{ExplorerError, Result};

const CURSOR_NAME: &str = "dataset_explorer_cursor";
const FETCH_SIZE: usize = 1000;

/// PostgreSQL reader
#[derive(Clone)]
pub struct PostgresReader {
    url: String,
}

impl PostgresReader {
    /// Create a reader for `url`. No connection is made until the first call.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn connect(&self) -> Result<Client> {
        Client::connect(&self.url, NoTls).map_err(|e| {
            ExplorerError::ReaderError(format!(
                "Failed to connect to {}: {}",
                self.redacted_url(),
                e
            ))
        })
    }

    /// Connection URL with the password masked, for logs and debug output
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        match rest.split_once('@') {
            Some((credentials, host)) if credentials.contains(':') => {
                let user = credentials.split(':').next().unwrap_or_default();
                format!("{}://{}:***@{}", scheme, user, host)
            }
            _ => self.url.clone(),
        }
    }
}

impl Reader for PostgresReader {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn stream(&self, sql: &str, sink: &mut dyn RowSink) -> Result<()> {
        debug!(target: "dataset_explorer::sql", "postgres: {}", sql);

        let mut client = self.connect()?;
        let mut transaction = client
            .transaction()
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to open transaction: {}", e)))?;

        transaction
            .batch_execute(&format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, sql))
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to execute SQL: {}", e)))?;

        let fetch = format!("FETCH {} FROM {}", FETCH_SIZE, CURSOR_NAME);
        let mut columns_sent = false;
        loop {
            let messages = transaction
                .simple_query(&fetch)
                .map_err(|e| ExplorerError::ReaderError(format!("Failed to fetch rows: {}", e)))?;

            let mut fetched = 0;
            for message in messages {
                match message {
                    SimpleQueryMessage::RowDescription(columns) => {
                        if !columns_sent {
                            let names: Vec<String> =
                                columns.iter().map(|c| c.name().to_string()).collect();
                            sink.columns(&names)?;
                            columns_sent = true;
                        }
                    }
                    SimpleQueryMessage::Row(row) => {
                        if !columns_sent {
                            let names: Vec<String> =
                                row.columns().iter().map(|c| c.name().to_string()).collect();
                            sink.columns(&names)?;
                            columns_sent = true;
                        }
                        let values = (0..row.len())
                            .map(|i| match row.get(i) {
                                Some(text) => Value::Text(text.to_string()),
                                None => Value::Null,
                            })
                            .collect();
                        sink.row(values)?;
                        fetched += 1;
                    }
                    _ => {}
                }
            }

            if fetched < FETCH_SIZE {
                break;
            }
        }

        if !columns_sent {
            sink.columns(&[])?;
        }

        // Read-only; committing just closes the cursor
        transaction
            .commit()
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to close cursor: {}", e)))
    }

    fn discover_columns(&self, schema: &str, table: &str) -> Result<Columns> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT att.attname::TEXT, pg_catalog.format_type(atttypid, NULL) AS display_type
FROM pg_attribute att
  JOIN pg_class tbl ON tbl.oid = att.attrelid
  JOIN pg_namespace ns ON tbl.relnamespace = ns.oid
WHERE tbl.relname = {} AND ns.nspname = {} AND attnum > 0 AND NOT att.attisdropped
ORDER BY attnum",
            dialect.quote_literal(table),
            dialect.quote_literal(schema)
        );
        let catalog = self.execute(&sql)?;
        Ok(classify_catalog(&catalog, schema, table, classify))
    }
}

/// Map a `format_type` display type to a semantic type
pub fn classify(column: &str, native_type: &str) -> Result<SemanticType> {
    match native_type {
        "character varying" | "text" | "character" => Ok(SemanticType::Text),
        "smallint" | "integer" | "bigint" | "real" | "double precision" | "numeric" => {
            Ok(SemanticType::Number)
        }
        "date"
        | "timestamp"
        | "timestamp with time zone"
        | "timestamp without time zone" => Ok(SemanticType::Date),
        "json" | "jsonb" => Ok(SemanticType::Json),
        "text[]" | "character varying[]" => Ok(SemanticType::TextArray),
        _ => Err(ExplorerError::UnsupportedColumnType {
            column: column.to_string(),
            native_type: native_type.to_string(),
        }),
    }
}

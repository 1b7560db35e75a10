//! DuckDB backend implementation
//!
//! The columnar warehouse variant. Executes against in-memory or file-based DuckDB
//! databases and discovers schemas through `information_schema`.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{params, Connection};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::column::{Columns, SemanticType};
use crate::reader::{classify_catalog, connection::ConnectionInfo, Dialect, Reader};
use crate::value::{RowSink, Value};
use crate::{ExplorerError, Result};

/// DuckDB database reader
///
/// The connection is not `Sync`, so it sits behind a mutex that every call locks for
/// the duration of one statement.
///
/// # Examples
///
/// ```rust,ignore
/// use dataset_explorer::reader::{Reader, DuckDBReader};
///
/// // In-memory database
/// let reader = DuckDBReader::from_connection_string("duckdb://memory")?;
/// let result = reader.execute("SELECT 1 as x, 2 as y")?;
///
/// // File-based database
/// let reader = DuckDBReader::from_connection_string("duckdb://data.db")?;
/// let result = reader.execute("SELECT * FROM sales")?;
/// ```
pub struct DuckDBReader {
    conn: Mutex<Connection>,
}

impl DuckDBReader {
    /// Create a new DuckDB reader from a connection string
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The connection string format is invalid
    /// - The database file cannot be opened
    /// - DuckDB initialization fails
    pub fn from_connection_string(uri: &str) -> Result<Self> {
        let conn_info = super::connection::parse_connection_string(uri)?;

        let conn = match conn_info {
            ConnectionInfo::DuckDBMemory => Connection::open_in_memory().map_err(|e| {
                ExplorerError::ReaderError(format!("Failed to open in-memory DuckDB: {}", e))
            })?,
            ConnectionInfo::DuckDBFile(path) => Connection::open(&path).map_err(|e| {
                ExplorerError::ReaderError(format!("Failed to open DuckDB file '{}': {}", path, e))
            })?,
            _ => {
                return Err(ExplorerError::ReaderError(format!(
                    "Connection string '{}' is not supported by DuckDBReader",
                    uri
                )))
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock and return the underlying DuckDB connection
    ///
    /// Useful for setup statements (CREATE TABLE, INSERT, etc.) and parameterized access.
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            ExplorerError::InternalError(format!("Failed to lock DuckDB connection: {}", e))
        })
    }

    /// A reader on its own connection to the same database
    ///
    /// Long-running streams use one so they do not hold this reader's lock.
    pub fn try_clone(&self) -> Result<Self> {
        let conn = self.connection()?.try_clone().map_err(|e| {
            ExplorerError::ReaderError(format!("Failed to open a second DuckDB connection: {}", e))
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Execute one or more statements that return no rows
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.connection()?
            .execute_batch(sql)
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to execute SQL: {}", e)))
    }
}

impl Reader for DuckDBReader {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDB
    }

    fn stream(&self, sql: &str, sink: &mut dyn RowSink) -> Result<()> {
        debug!(target: "dataset_explorer::sql", "duckdb: {}", sql);

        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to prepare SQL: {}", e)))?;
        let mut rows = stmt
            .query(params![])
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to execute SQL: {}", e)))?;

        let column_names = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();
        sink.columns(&column_names)?;

        while let Some(row) = rows
            .next()
            .map_err(|e| ExplorerError::ReaderError(format!("Failed to iterate rows: {}", e)))?
        {
            let mut values = Vec::with_capacity(column_names.len());
            for col_idx in 0..column_names.len() {
                let value: DuckValue = row.get(col_idx).map_err(|e| {
                    ExplorerError::ReaderError(format!(
                        "Failed to read column '{}': {}",
                        column_names[col_idx], e
                    ))
                })?;
                values.push(convert_value(value, &column_names[col_idx]));
            }
            sink.row(values)?;
        }

        Ok(())
    }

    fn discover_columns(&self, schema: &str, table: &str) -> Result<Columns> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT column_name, data_type
FROM information_schema.columns
WHERE table_schema = {} AND table_name = {}
ORDER BY ordinal_position",
            dialect.quote_literal(schema),
            dialect.quote_literal(table)
        );
        let catalog = self.execute(&sql)?;
        Ok(classify_catalog(&catalog, schema, table, classify))
    }
}

/// Map a DuckDB `information_schema` data type to a semantic type
pub fn classify(column: &str, native_type: &str) -> Result<SemanticType> {
    let upper = native_type.trim().to_uppercase();

    if let Some(element) = upper.strip_suffix("[]") {
        return match element {
            "VARCHAR" | "TEXT" | "STRING" => Ok(SemanticType::TextArray),
            _ => Err(unsupported(column, native_type)),
        };
    }

    // DECIMAL(18,3), STRUCT(a INTEGER), MAP(VARCHAR, INTEGER)
    let base = upper.split('(').next().unwrap_or(&upper).trim();
    match base {
        "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" => Ok(SemanticType::Text),
        "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
        | "USMALLINT" | "UINTEGER" | "UBIGINT" | "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL"
        | "NUMERIC" => Ok(SemanticType::Number),
        // Time of day has no DATE cast, so TIME columns are not supported
        "DATE" | "TIMESTAMP" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" | "TIMESTAMP_S"
        | "TIMESTAMP_MS" | "TIMESTAMP_NS" | "DATETIME" => Ok(SemanticType::Date),
        "JSON" | "STRUCT" | "MAP" => Ok(SemanticType::Json),
        _ => Err(unsupported(column, native_type)),
    }
}

fn unsupported(column: &str, native_type: &str) -> ExplorerError {
    ExplorerError::UnsupportedColumnType {
        column: column.to_string(),
        native_type: native_type.to_string(),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Convert a DuckDB value into a result cell
fn convert_value(value: DuckValue, column_name: &str) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i as i64),
        DuckValue::SmallInt(i) => Value::Int(i as i64),
        DuckValue::Int(i) => Value::Int(i as i64),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(i) => Value::Int(i as i64),
        DuckValue::USmallInt(i) => Value::Int(i as i64),
        DuckValue::UInt(i) => Value::Int(i as i64),
        DuckValue::UBigInt(i) => match i64::try_from(i) {
            Ok(v) => Value::Int(v),
            Err(_) => {
                warn!("UBigInt overflow in column '{}', converting to text", column_name);
                Value::Text(i.to_string())
            }
        },
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(v) => Value::Int(v),
            Err(_) => {
                warn!("HugeInt overflow in column '{}', converting to text", column_name);
                Value::Text(i.to_string())
            }
        },
        DuckValue::Float(f) => Value::Float(f as f64),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => {
            let decimal_str = d.to_string();
            match decimal_str.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::Text(decimal_str),
            }
        }
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64)))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, t) => DateTime::from_timestamp_micros(to_micros(unit, t))
            .map(|dt| Value::Timestamp(dt.naive_utc()))
            .unwrap_or(Value::Null),
        DuckValue::Time64(unit, t) => {
            let micros = to_micros(unit, t);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .map(Value::Time)
            .unwrap_or(Value::Null)
        }
        DuckValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| convert_value(item, column_name))
                .collect(),
        ),
        other => {
            debug!("Using fallback text conversion for column '{}'", column_name);
            Value::Text(format!("{:?}", other))
        }
    }
}

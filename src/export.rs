//! Streaming CSV export of query results
//!
//! Rows go from the backend straight into a [`csv::Writer`]; nothing is buffered
//! beyond what the backend fetches per batch. Each export streams on its own connection. Exports check a [`CancellationToken`]
//! before every row, so a caller can abort a long dump from another thread.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::query::Query;
use crate::reader::Reader;
use crate::value::{RowSink, Value};
use crate::{ExplorerError, Result};

/// Token checked by the export loop
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

/// Handle kept by the caller to cancel a running export
#[derive(Clone, Debug)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

/// Create a connected (token, handle) pair
pub fn cancellation_pair() -> (CancellationToken, CancellationHandle) {
    let flag = Arc::new(AtomicBool::new(false));
    (
        CancellationToken {
            flag: Arc::clone(&flag),
        },
        CancellationHandle { flag },
    )
}

impl CancellationToken {
    /// A token nobody can cancel
    pub fn never() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl CancellationHandle {
    /// Idempotent
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Output options of a CSV export
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsvOptions {
    pub delimiter: u8,
    /// `'.'` or `','`; with `','` number columns are written with a decimal comma
    pub decimal_mark: char,
    pub redact_personal_data: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            decimal_mark: '.',
            redact_personal_data: true,
        }
    }
}

/// File name for an export of `data_set_id`, e.g. `sales-big-customers-2024-05-01.csv`
pub fn csv_file_name(data_set_id: &str, query_id: &str, date: NaiveDate) -> String {
    let mut name = data_set_id.to_string();
    if !query_id.is_empty() {
        name.push('-');
        name.push_str(query_id);
    }
    format!("{}-{}.csv", name, date.format("%Y-%m-%d"))
}

struct CsvSink<'a, W: Write> {
    writer: csv::Writer<W>,
    cancel: &'a CancellationToken,
    rows: u64,
}

impl<W: Write> RowSink for CsvSink<'_, W> {
    fn columns(&mut self, names: &[String]) -> Result<()> {
        self.writer.write_record(names).map_err(csv_error)
    }

    fn row(&mut self, values: Vec<Value>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ExplorerError::Cancelled);
        }
        self.writer
            .write_record(values.iter().map(|v| v.to_string()))
            .map_err(csv_error)?;
        self.rows += 1;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> ExplorerError {
    ExplorerError::ExportError(format!("Failed to write CSV: {}", e))
}

/// Write all rows of `query` as CSV with a header line
///
/// Returns the number of data rows written. A query without columns writes nothing.
///
/// # Errors
///
/// `Cancelled` when the token fires, `ExportError` when writing fails, and reader
/// errors from the backend.
pub fn export_csv<W: Write>(
    query: &Query,
    writer: W,
    options: CsvOptions,
    cancel: &CancellationToken,
) -> Result<u64> {
    let Some(sql) =
        query.compile_select(None, None, options.decimal_mark, options.redact_personal_data)?
    else {
        debug!("Nothing to export for data set '{}'", query.data_set().id);
        return Ok(0);
    };

    let mut sink = CsvSink {
        writer: csv::WriterBuilder::new()
            .delimiter(options.delimiter)
            .from_writer(writer),
        cancel,
        rows: 0,
    };
    // A slow writer must not block other users of the shared connection
    let backend = query.data_set().backend().try_clone()?;
    backend.stream(&sql, &mut sink)?;
    sink.writer
        .flush()
        .map_err(|e| ExplorerError::ExportError(format!("Failed to flush CSV: {}", e)))?;

    info!(
        "Exported {} rows of data set '{}'",
        sink.rows,
        query.data_set().id
    );
    Ok(sink.rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::registry;
    use crate::query::{QueryDict, SortOrder};

    fn sorted_query(columns: &[&str]) -> (crate::data_set::DataSetRegistry, QueryDict) {
        let mut dict = QueryDict::new("sales");
        dict.column_names = Some(columns.iter().map(|s| s.to_string()).collect());
        dict.sort_column_name = Some("id".to_string());
        dict.sort_order = Some(SortOrder::Asc);
        (registry(), dict)
    }

    #[test]
    fn test_export_with_redaction_and_decimal_comma() {
        let (registry, dict) = sorted_query(&["id", "email", "amount"]);
        let query = Query::from_dict(&registry, dict).unwrap();

        let mut out = Vec::new();
        let options = CsvOptions {
            delimiter: b';',
            decimal_mark: ',',
            redact_personal_data: true,
        };
        let rows = export_csv(&query, &mut out, options, &CancellationToken::never()).unwrap();
        assert_eq!(rows, 5);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id;email;amount");
        assert_eq!(lines[1], "1;🔒;10,0");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_export_without_redaction() {
        let (registry, dict) = sorted_query(&["id", "email"]);
        let query = Query::from_dict(&registry, dict).unwrap();

        let mut out = Vec::new();
        let options = CsvOptions {
            redact_personal_data: false,
            ..CsvOptions::default()
        };
        export_csv(&query, &mut out, options, &CancellationToken::never()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1,a@acme.test\n"));
        // NULL becomes an empty field
        assert!(text.contains("4,\n"));
    }

    #[test]
    fn test_cancelled_export() {
        let (registry, dict) = sorted_query(&["id"]);
        let query = Query::from_dict(&registry, dict).unwrap();

        let (token, handle) = cancellation_pair();
        handle.cancel();
        let result = export_csv(&query, Vec::new(), CsvOptions::default(), &token);
        assert!(matches!(result, Err(ExplorerError::Cancelled)));
    }

    #[test]
    fn test_export_without_columns() {
        let (registry, dict) = sorted_query(&[]);
        let query = Query::from_dict(&registry, dict).unwrap();
        let mut out = Vec::new();
        let rows =
            export_csv(&query, &mut out, CsvOptions::default(), &CancellationToken::never())
                .unwrap();
        assert_eq!(rows, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_export_to_file() {
        let (registry, dict) = sorted_query(&["id", "name"]);
        let query = Query::from_dict(&registry, dict).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");

        let file = std::fs::File::create(&path).unwrap();
        export_csv(&query, file, CsvOptions::default(), &CancellationToken::never()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("id,name\n1,Acme\n2,acme corp\n"));
    }

    #[test]
    fn test_csv_file_name() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(csv_file_name("sales", "", date), "sales-2024-05-01.csv");
        assert_eq!(
            csv_file_name("sales", "big-customers", date),
            "sales-big-customers-2024-05-01.csv"
        );
    }
}

//! Backend selection from `duckdb://` and `postgres://` URIs.

use crate::{ExplorerError, Result};

/// Which backend a URI names, and what to open it with
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionInfo {
    DuckDBMemory,
    /// Path as written after the scheme; `duckdb:///tmp/x.db` keeps its leading slash
    DuckDBFile(String),
    /// Full URI, handed to the postgres client unchanged
    PostgreSQL(String),
}

/// Map a data set URI onto a backend.
///
/// `duckdb://memory` opens an in-memory database and any other `duckdb://`
/// suffix is a file path. Both `postgres://` and `postgresql://` are accepted.
pub fn parse_connection_string(uri: &str) -> Result<ConnectionInfo> {
    if let Some(rest) = uri.strip_prefix("duckdb://") {
        return match rest {
            "memory" => Ok(ConnectionInfo::DuckDBMemory),
            path if path.trim_start_matches('/').is_empty() => Err(ExplorerError::ReaderError(
                format!("Missing database file in '{}'", uri),
            )),
            path => Ok(ConnectionInfo::DuckDBFile(path.to_string())),
        };
    }

    if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
        return Ok(ConnectionInfo::PostgreSQL(uri.to_string()));
    }

    Err(ExplorerError::ReaderError(format!(
        "Unsupported data set URI '{}': expected duckdb:// or postgres://",
        uri
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duckdb_uris() {
        let cases = [
            ("duckdb://memory", ConnectionInfo::DuckDBMemory),
            ("duckdb://sales.duckdb", ConnectionInfo::DuckDBFile("sales.duckdb".into())),
            ("duckdb:///srv/data/sales.duckdb", ConnectionInfo::DuckDBFile("/srv/data/sales.duckdb".into())),
        ];
        for (uri, expected) in cases {
            assert_eq!(parse_connection_string(uri).unwrap(), expected, "{}", uri);
        }
    }

    #[test]
    fn test_postgres_uri_is_passed_through() {
        for uri in ["postgres://explorer@db/sales", "postgresql://explorer@db:5433/sales"] {
            assert_eq!(
                parse_connection_string(uri).unwrap(),
                ConnectionInfo::PostgreSQL(uri.to_string())
            );
        }
    }

    #[test]
    fn test_rejected_uris() {
        for uri in ["duckdb://", "duckdb:///", "mysql://db/sales", "sales.duckdb"] {
            let err = parse_connection_string(uri).unwrap_err();
            assert!(matches!(err, ExplorerError::ReaderError(_)), "{}", uri);
            assert!(err.to_string().contains(uri), "{}", err);
        }
    }
}

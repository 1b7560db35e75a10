//! SQL dialects of the supported backends
//!
//! All identifier and literal quoting goes through here. The query compiler never
//! interpolates a user-supplied string without passing it through [`Dialect::quote_literal`]
//! or [`Dialect::quote_identifier`].

use chrono::NaiveDate;

/// SQL flavour spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Row-store engine (PostgreSQL): `ARRAY[..]::TEXT[]`, `&&`, `ILIKE ANY`, `::` casts
    Postgres,
    /// Columnar warehouse engine (DuckDB): list literals, `list_has_any`, `CAST(.. AS ..)`
    DuckDB,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::DuckDB => "duckdb",
        }
    }

    /// Quote a column, schema or table name
    pub fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Quote a text constant
    pub fn quote_literal(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }

    /// Fully qualified, quoted table reference
    pub fn table_ref(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(schema),
            self.quote_identifier(table)
        )
    }

    /// Literal array of text values
    pub fn text_array(&self, values: &[String]) -> String {
        let items = values
            .iter()
            .map(|v| self.quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        match self {
            Dialect::Postgres => format!("ARRAY[{}]::TEXT[]", items),
            Dialect::DuckDB => format!("[{}]", items),
        }
    }

    /// Case-insensitive "contains any of" test, OR semantics across `values`
    pub fn contains_any(&self, expr: &str, values: &[String]) -> String {
        let patterns: Vec<String> = values.iter().map(|v| format!("%{}%", v)).collect();
        match self {
            Dialect::Postgres => format!("{} ILIKE ANY({})", expr, self.text_array(&patterns)),
            Dialect::DuckDB => {
                let tests: Vec<String> = patterns
                    .iter()
                    .map(|p| format!("{} ILIKE {}", expr, self.quote_literal(p)))
                    .collect();
                format!("({})", tests.join(" OR "))
            }
        }
    }

    /// True when the array in `expr` shares at least one element with `values`
    pub fn array_overlap(&self, expr: &str, values: &[String]) -> String {
        match self {
            Dialect::Postgres => format!("{} && {}", expr, self.text_array(values)),
            Dialect::DuckDB => format!("list_has_any({}, {})", expr, self.text_array(values)),
        }
    }

    pub fn cast_text(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("{}::TEXT", expr),
            Dialect::DuckDB => format!("CAST({} AS VARCHAR)", expr),
        }
    }

    pub fn cast_date(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("{}::DATE", expr),
            Dialect::DuckDB => format!("CAST({} AS DATE)", expr),
        }
    }

    pub fn cast_float(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("({})::DOUBLE PRECISION", expr),
            Dialect::DuckDB => format!("CAST({} AS DOUBLE)", expr),
        }
    }

    /// Timestamp constant at midnight of `date`
    pub fn timestamp_literal(&self, date: NaiveDate) -> String {
        format!("TIMESTAMP '{}'", date.format("%Y-%m-%d"))
    }
}

//! Result cells and row streaming
//!
//! Backends convert their native values into [`Value`] and push rows into a [`RowSink`].
//! [`ResultSet`] is the sink that simply collects everything.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::fmt;

use crate::Result;

/// A single cell of a query result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Time(NaiveTime),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Text is parsed, which is how the row-store
    /// backend hands back every cell.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            Value::Text(s) => {
                let s = s.trim();
                NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Value::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Receiver for streamed query results
///
/// `columns` is called exactly once, before the first row. Returning an error from
/// either method aborts the running statement.
pub trait RowSink {
    fn columns(&mut self, names: &[String]) -> Result<()>;
    fn row(&mut self, values: Vec<Value>) -> Result<()>;
}

/// Fully materialized query result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row, for `SELECT count(*)`-style statements
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

impl RowSink for ResultSet {
    fn columns(&mut self, names: &[String]) -> Result<()> {
        self.column_names = names.to_vec();
        Ok(())
    }

    fn row(&mut self, values: Vec<Value>) -> Result<()> {
        self.rows.push(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views_parse_text() {
        assert_eq!(Value::Text("42".to_string()).as_i64(), Some(42));
        assert_eq!(Value::Text(" 1.5 ".to_string()).as_f64(), Some(1.5));
        assert_eq!(Value::Int(7).as_f64(), Some(7.0));
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_date_view_accepts_timestamps_as_text() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            Value::Text("2024-03-01 10:00:00".to_string()).as_date(),
            Some(expected)
        );
        assert_eq!(Value::Date(expected).as_date(), Some(expected));
    }

    #[test]
    fn test_display_lists_like_postgres_arrays() {
        let list = Value::List(vec![
            Value::Text("a".to_string()),
            Value::Text("b".to_string()),
        ]);
        assert_eq!(list.to_string(), "{a,b}");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_serialize_untagged() {
        let json = serde_json::to_string(&vec![Value::Int(1), Value::Null]).unwrap();
        assert_eq!(json, "[1,null]");
    }
}

//! Columns of a data set and their semantic types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-independent classification of a column
///
/// Every native column type a backend reports is reduced to one of these.
/// The serialized form (`text`, `number`, `date`, `json`, `text[]`) is what
/// the UI receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "text[]")]
    TextArray,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Text => "text",
            SemanticType::Number => "number",
            SemanticType::Date => "date",
            SemanticType::Json => "json",
            SemanticType::TextArray => "text[]",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column of a data set table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    #[serde(rename = "column_name")]
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
}

impl Column {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
        }
    }

    /// Whether the backend can order rows by this column
    pub fn sortable(&self) -> bool {
        !matches!(
            self.semantic_type,
            SemanticType::Json | SemanticType::TextArray
        )
    }
}

/// Discovered columns of a table, in table order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns(Vec<Column>);

impl Columns {
    pub fn new(columns: Vec<Column>) -> Self {
        Self(columns)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.0.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Column at `pos` in table order
    pub fn at(&self, pos: usize) -> Option<&Column> {
        self.0.get(pos)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Column> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Columns {
    type Item = &'a Column;
    type IntoIter = std::slice::Iter<'a, Column>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

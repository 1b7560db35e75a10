//! Queries on data sets
//!
//! A [`Query`] describes which rows and columns of a data set a user wants to see:
//! selected columns, filters, sort and timestamps of the saved version. It is built
//! against the data set's discovered schema. Columns and filters that do not fit that
//! schema are dropped on construction, never reported as errors, so a saved query keeps
//! loading after a column disappears from the table.
//!
//! - [`compile`] turns a query into SQL for the data set's backend
//! - [`distribution`] computes histograms under the query's filters
//! - [`store`] persists queries

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::column::SemanticType;
use crate::data_set::{DataSet, DataSetRegistry};
use crate::reader::{count_from, Reader};
use crate::value::ResultSet;
use crate::{ExplorerError, Result};

pub mod compile;
pub mod distribution;
pub mod store;

pub use distribution::{DateBucket, Distribution, Frequency, NumericBucket, Resolution};
pub use store::{DuckDBQueryStore, QueryStore, QuerySummary};

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Contains (text) or overlaps (text arrays)
    #[serde(rename = "~")]
    Contains,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Contains => "~",
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
        }
    }

    /// Whether a filter on a column of `semantic_type` may use this operator
    pub fn is_legal_for(&self, semantic_type: SemanticType) -> bool {
        match semantic_type {
            SemanticType::Text | SemanticType::TextArray => matches!(
                self,
                Operator::Contains | Operator::Equal | Operator::NotEqual
            ),
            SemanticType::Number | SemanticType::Date => *self != Operator::Contains,
            SemanticType::Json => true,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The constant a column is compared to
///
/// Text filters carry a list of values, number filters a number and date filters a
/// `YYYY-MM-DD` string. Numbers sent as strings are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Many(Vec<String>),
    Number(f64),
    One(String),
}

impl Default for FilterValue {
    fn default() -> Self {
        FilterValue::Many(Vec::new())
    }
}

impl FilterValue {
    /// All values as text
    pub fn texts(&self) -> Vec<String> {
        match self {
            FilterValue::Many(values) => values.clone(),
            FilterValue::Number(n) => vec![n.to_string()],
            FilterValue::One(s) => vec![s.clone()],
        }
    }

    /// The single text value, if there is exactly one
    pub fn as_text(&self) -> Option<String> {
        match self {
            FilterValue::Many(values) if values.len() == 1 => values.first().cloned(),
            FilterValue::Many(_) => None,
            FilterValue::Number(n) => Some(n.to_string()),
            FilterValue::One(s) => Some(s.clone()),
        }
    }

    /// The value as a finite number
    pub fn as_number(&self) -> Option<f64> {
        let n = match self {
            FilterValue::Number(n) => *n,
            other => other.as_text()?.trim().parse::<f64>().ok()?,
        };
        n.is_finite().then_some(n)
    }
}

/// A "where condition" of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column_name: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: FilterValue,
}

impl Filter {
    pub fn new(column_name: impl Into<String>, operator: Operator, value: FilterValue) -> Self {
        Self {
            column_name: column_name.into(),
            operator,
            value,
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

fn default_sort_order() -> Option<SortOrder> {
    Some(SortOrder::Asc)
}

/// Wire form of a query, as exchanged with the UI
///
/// A missing `column_names` selects the data set's default columns. Timestamps are
/// written as `YYYY-MM-DD`; full `YYYY-MM-DD HH:MM:SS` timestamps are accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDict {
    pub data_set_id: String,
    #[serde(default)]
    pub query_id: String,
    #[serde(default)]
    pub column_names: Option<Vec<String>>,
    #[serde(default)]
    pub sort_column_name: Option<String>,
    #[serde(default = "default_sort_order")]
    pub sort_order: Option<SortOrder>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl QueryDict {
    /// A fresh query on `data_set_id` with default columns and no filters
    pub fn new(data_set_id: impl Into<String>) -> Self {
        Self {
            data_set_id: data_set_id.into(),
            query_id: String::new(),
            column_names: None,
            sort_column_name: None,
            sort_order: default_sort_order(),
            filters: Vec::new(),
            created_at: None,
            created_by: None,
            updated_at: None,
            updated_by: None,
        }
    }
}

/// Turn a user-chosen name into a query id: runs of non-word characters become `-`
pub fn slugify(query_id: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\W+").expect("Invalid slug regex"));
    re.replace_all(query_id, "-").to_lowercase()
}

fn parse_timestamp(field: &str, value: Option<&str>) -> Result<Option<NaiveDateTime>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, pattern) {
            return Ok(Some(ts));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|d| Some(d.and_time(chrono::NaiveTime::MIN)))
        .map_err(|_| {
            ExplorerError::ValidationError(format!("Invalid {} '{}'", field, value))
        })
}

/// A query on a data set, validated against its schema
#[derive(Debug, Clone)]
pub struct Query {
    data_set: Arc<DataSet>,
    query_id: String,
    column_names: Vec<String>,
    sort_column_name: Option<String>,
    sort_order: Option<SortOrder>,
    filters: Vec<Filter>,
    created_at: Option<NaiveDateTime>,
    created_by: Option<String>,
    updated_at: Option<NaiveDateTime>,
    updated_by: Option<String>,
}

impl Query {
    /// A fresh query showing the default columns of `data_set_id`
    pub fn new(registry: &DataSetRegistry, data_set_id: &str) -> Result<Self> {
        Self::from_dict(registry, QueryDict::new(data_set_id))
    }

    /// Build a query from its wire form
    ///
    /// # Errors
    ///
    /// `UnknownDataSet` if no data set has the dict's id, `ValidationError` for
    /// unparsable timestamps, and reader errors from schema discovery.
    pub fn from_dict(registry: &DataSetRegistry, dict: QueryDict) -> Result<Self> {
        let data_set = registry.get(&dict.data_set_id)?;
        Self::with_data_set(data_set, dict)
    }

    /// Build a query on an already resolved data set; `dict.data_set_id` is ignored
    pub fn with_data_set(data_set: Arc<DataSet>, dict: QueryDict) -> Result<Self> {
        let columns = data_set.columns()?;

        let requested = dict
            .column_names
            .unwrap_or_else(|| data_set.default_column_names.clone());
        let column_names: Vec<String> = requested
            .into_iter()
            .filter(|name| {
                let known = columns.contains(name);
                if !known {
                    warn!("Dropping unknown column '{}' of data set '{}'", name, data_set.id);
                }
                known
            })
            .collect();

        let sort_column_name = dict
            .sort_column_name
            .filter(|name| columns.get(name).is_some_and(|c| c.sortable()));

        let filters = dict
            .filters
            .into_iter()
            .filter(|filter| match columns.get(&filter.column_name) {
                None => {
                    warn!(
                        "Dropping filter on unknown column '{}' of data set '{}'",
                        filter.column_name, data_set.id
                    );
                    false
                }
                Some(column) => match filter_problem(filter, column.semantic_type) {
                    Some(problem) => {
                        warn!(
                            "Dropping filter on '{}' of data set '{}': {}",
                            filter.column_name, data_set.id, problem
                        );
                        false
                    }
                    None => true,
                },
            })
            .collect();

        let created_at = parse_timestamp("created_at", dict.created_at.as_deref())?;
        let updated_at = parse_timestamp("updated_at", dict.updated_at.as_deref())?;

        Ok(Self {
            query_id: slugify(&dict.query_id),
            column_names,
            sort_column_name,
            sort_order: dict.sort_order,
            filters,
            created_at,
            created_by: dict.created_by,
            updated_at,
            updated_by: dict.updated_by,
            data_set,
        })
    }

    /// Wire form of the query
    pub fn to_dict(&self) -> QueryDict {
        let date = |ts: &Option<NaiveDateTime>| ts.map(|ts| ts.format("%Y-%m-%d").to_string());
        QueryDict {
            data_set_id: self.data_set.id.clone(),
            query_id: self.query_id.clone(),
            column_names: Some(self.column_names.clone()),
            sort_column_name: self.sort_column_name.clone(),
            sort_order: self.sort_order,
            filters: self.filters.clone(),
            created_at: date(&self.created_at),
            created_by: self.created_by.clone(),
            updated_at: date(&self.updated_at),
            updated_by: self.updated_by.clone(),
        }
    }

    pub fn data_set(&self) -> &Arc<DataSet> {
        &self.data_set
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn sort_column_name(&self) -> Option<&str> {
        self.sort_column_name.as_deref()
    }

    pub fn sort_order(&self) -> Option<SortOrder> {
        self.sort_order
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created_at
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn updated_at(&self) -> Option<NaiveDateTime> {
        self.updated_at
    }

    pub fn updated_by(&self) -> Option<&str> {
        self.updated_by.as_deref()
    }

    /// Execute the query and collect the rows
    ///
    /// A query without columns yields an empty result without touching the backend.
    pub fn run(
        &self,
        limit: Option<u64>,
        offset: Option<u64>,
        redact_personal_data: bool,
    ) -> Result<ResultSet> {
        match self.compile_select(limit, offset, '.', redact_personal_data)? {
            Some(sql) => self.data_set.backend().execute(&sql),
            None => Ok(ResultSet::default()),
        }
    }

    /// Number of rows matching all filters
    pub fn row_count(&self) -> Result<i64> {
        let sql = self.row_count_sql()?;
        count_from(&self.data_set.backend().execute(&sql)?)
    }

    /// Number of rows matching only the filter at `pos`, ignoring all others
    pub fn filter_row_count(&self, pos: usize) -> Result<i64> {
        let sql = self.filter_row_count_sql(pos)?;
        count_from(&self.data_set.backend().execute(&sql)?)
    }
}

/// Why a filter cannot be applied to a column of `semantic_type`, if it cannot
fn filter_problem(filter: &Filter, semantic_type: SemanticType) -> Option<String> {
    if !filter.operator.is_legal_for(semantic_type) {
        return Some(format!(
            "operator '{}' is not allowed on {} columns",
            filter.operator, semantic_type
        ));
    }
    match semantic_type {
        SemanticType::Number if filter.value.as_number().is_none() => {
            Some(format!("{:?} is not a number", filter.value))
        }
        SemanticType::Date if filter.value.as_text().is_none() => {
            Some(format!("{:?} is not a single date", filter.value))
        }
        _ => None,
    }
}

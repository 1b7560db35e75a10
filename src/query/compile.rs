//! SQL compilation of queries
//!
//! Every statement derived from a query (the select itself, row counts, per-filter
//! counts and the distribution statements) renders its filters through
//! [`Query::filter_to_sql`], so all numbers shown for a query agree with its rows.

use crate::column::SemanticType;
use crate::query::{Filter, Operator, Query};
use crate::reader::Reader;
use crate::{ExplorerError, Result};

/// Marker selected in place of a redacted personal data value
pub const REDACTED_MARKER: &str = "🔒";

impl Query {
    /// Compile the select statement
    ///
    /// Returns `None` when no columns are selected. With `decimal_mark` `','` number
    /// columns are rendered as text with a decimal comma. With `redact_personal_data`
    /// personal data columns select [`REDACTED_MARKER`] instead of their values.
    /// `limit` and `offset` are applied independently.
    pub fn compile_select(
        &self,
        limit: Option<u64>,
        offset: Option<u64>,
        decimal_mark: char,
        redact_personal_data: bool,
    ) -> Result<Option<String>> {
        if self.column_names().is_empty() {
            return Ok(None);
        }

        let data_set = self.data_set();
        let dialect = data_set.backend().dialect();
        let columns = data_set.columns()?;

        let projection: Vec<String> = self
            .column_names()
            .iter()
            .map(|name| {
                let quoted = dialect.quote_identifier(name);
                let semantic_type = columns.get(name).map(|c| c.semantic_type);
                if redact_personal_data && data_set.is_personal_data(name) {
                    format!("{} AS {}", dialect.quote_literal(REDACTED_MARKER), quoted)
                } else if semantic_type == Some(SemanticType::Number) && decimal_mark == ',' {
                    format!(
                        "REPLACE({}, '.', ',') AS {}",
                        dialect.cast_text(&quoted),
                        quoted
                    )
                } else {
                    quoted
                }
            })
            .collect();

        let mut lines = vec![
            format!("SELECT {}", projection.join(", ")),
            format!("FROM {}", data_set.table_ref()),
        ];
        if let Some(where_clause) = self.filters_to_sql()? {
            lines.push(where_clause);
        }
        if let (Some(column), Some(order)) = (self.sort_column_name(), self.sort_order()) {
            lines.push(format!(
                "ORDER BY {} {} NULLS LAST",
                dialect.quote_identifier(column),
                order.as_sql()
            ));
        }
        if let Some(limit) = limit {
            lines.push(format!("LIMIT {}", limit));
        }
        if let Some(offset) = offset {
            lines.push(format!("OFFSET {}", offset));
        }

        Ok(Some(lines.join("\n")))
    }

    /// Statement without paging and personal data, for display
    pub fn to_sql(&self) -> Result<Option<String>> {
        self.compile_select(None, None, '.', false)
    }

    /// Statement as shown to a user; personal data is redacted unless they may see it
    pub fn display_sql(&self, redact_personal_data: bool) -> Result<Option<String>> {
        self.compile_select(None, None, '.', redact_personal_data)
    }

    /// `WHERE` clause with all filters AND-joined, `None` without filters
    pub fn filters_to_sql(&self) -> Result<Option<String>> {
        let conditions = self.filter_conditions()?;
        if conditions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("WHERE {}", conditions.join(" AND "))))
        }
    }

    /// Each filter rendered as a condition, in filter order
    pub(crate) fn filter_conditions(&self) -> Result<Vec<String>> {
        self.filters()
            .iter()
            .map(|filter| self.filter_to_sql(filter))
            .collect()
    }

    /// Render one filter as a boolean SQL expression
    ///
    /// Columns whose type has no filter semantics (json, or a column that vanished
    /// from the schema) compile to `1=1`.
    pub fn filter_to_sql(&self, filter: &Filter) -> Result<String> {
        let data_set = self.data_set();
        let dialect = data_set.backend().dialect();
        let Some(column) = data_set.columns()?.get(&filter.column_name) else {
            return Ok("1=1".to_string());
        };
        let quoted = dialect.quote_identifier(&filter.column_name);

        let mut values = filter.value.texts();
        if values.is_empty() {
            values.push(String::new());
        }

        let sql = match column.semantic_type {
            SemanticType::Text => match filter.operator {
                Operator::Contains => dialect.contains_any(&quoted, &values),
                op => {
                    let list = values
                        .iter()
                        .map(|v| dialect.quote_literal(v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let keyword = if op == Operator::NotEqual {
                        "NOT IN"
                    } else {
                        "IN"
                    };
                    format!("{} {} ({})", quoted, keyword, list)
                }
            },
            SemanticType::TextArray => {
                let overlap = dialect.array_overlap(&quoted, &values);
                if filter.operator == Operator::NotEqual {
                    format!("NOT ({})", overlap)
                } else {
                    overlap
                }
            }
            SemanticType::Number => {
                let number = filter.value.as_number().ok_or_else(|| {
                    ExplorerError::ValidationError(format!(
                        "Filter on '{}' needs a number, got {:?}",
                        filter.column_name, filter.value
                    ))
                })?;
                format!("{} {} {}", quoted, sql_operator(filter.operator), number)
            }
            SemanticType::Date => {
                let date = filter.value.as_text().unwrap_or_default();
                format!(
                    "{} {} {}",
                    dialect.cast_date(&quoted),
                    sql_operator(filter.operator),
                    dialect.quote_literal(&date)
                )
            }
            SemanticType::Json => "1=1".to_string(),
        };
        Ok(sql)
    }

    /// `SELECT count(*)` under all filters
    pub fn row_count_sql(&self) -> Result<String> {
        let mut sql = format!("SELECT count(*) FROM {}", self.data_set().table_ref());
        if let Some(where_clause) = self.filters_to_sql()? {
            sql.push('\n');
            sql.push_str(&where_clause);
        }
        Ok(sql)
    }

    /// `SELECT count(*)` under only the filter at `pos`
    pub fn filter_row_count_sql(&self, pos: usize) -> Result<String> {
        let filter = self.filters().get(pos).ok_or_else(|| {
            ExplorerError::ValidationError(format!(
                "Filter position {} out of range, query has {} filters",
                pos,
                self.filters().len()
            ))
        })?;
        Ok(format!(
            "SELECT count(*) FROM {}\nWHERE {}",
            self.data_set().table_ref(),
            self.filter_to_sql(filter)?
        ))
    }
}

/// SQL spelling of a comparison operator
fn sql_operator(op: Operator) -> &'static str {
    match op {
        Operator::NotEqual => "<>",
        other => other.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_set::DataSetRegistry;
    use crate::query::tests::{filter, many, registry};
    use crate::query::{FilterValue, QueryDict, SortOrder};

    fn query(registry: &DataSetRegistry, dict: QueryDict) -> Query {
        Query::from_dict(registry, dict).unwrap()
    }

    #[test]
    fn test_select_with_filter_sort_and_paging() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![filter("name", Operator::Contains, many(&["acme"]))];
        dict.sort_column_name = Some("id".to_string());
        dict.sort_order = Some(SortOrder::Desc);
        let sql = query(&registry, dict)
            .compile_select(Some(10), Some(0), '.', false)
            .unwrap()
            .unwrap();

        assert_eq!(
            sql,
            "SELECT \"id\", \"name\"
FROM \"main\".\"orders\"
WHERE (\"name\" ILIKE '%acme%')
ORDER BY \"id\" DESC NULLS LAST
LIMIT 10
OFFSET 0"
        );
    }

    #[test]
    fn test_no_columns_compiles_to_none() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.column_names = Some(Vec::new());
        assert_eq!(query(&registry, dict).to_sql().unwrap(), None);
    }

    #[test]
    fn test_redaction_replaces_personal_data() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.column_names = Some(vec!["name".to_string(), "email".to_string()]);
        let q = query(&registry, dict);

        let redacted = q.compile_select(None, None, '.', true).unwrap().unwrap();
        assert!(redacted.starts_with("SELECT \"name\", '🔒' AS \"email\"\n"));

        let plain = q.compile_select(None, None, '.', false).unwrap().unwrap();
        assert!(plain.starts_with("SELECT \"name\", \"email\"\n"));

        let rows = q.run(None, None, true).unwrap();
        assert!(rows
            .rows
            .iter()
            .all(|row| row[1].as_str() == Some(REDACTED_MARKER)));
    }

    #[test]
    fn test_decimal_comma() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.column_names = Some(vec!["name".to_string(), "amount".to_string()]);
        let sql = query(&registry, dict)
            .compile_select(None, None, ',', false)
            .unwrap()
            .unwrap();
        assert!(sql.starts_with(
            "SELECT \"name\", REPLACE(CAST(\"amount\" AS VARCHAR), '.', ',') AS \"amount\"\n"
        ));
    }

    #[test]
    fn test_limit_and_offset_are_independent() {
        let registry = registry();
        let q = query(&registry, QueryDict::new("sales"));
        let only_offset = q.compile_select(None, Some(20), '.', false).unwrap().unwrap();
        assert!(only_offset.ends_with("\nOFFSET 20"));
        assert!(!only_offset.contains("LIMIT"));
        let only_limit = q.compile_select(Some(5), None, '.', false).unwrap().unwrap();
        assert!(only_limit.ends_with("\nLIMIT 5"));
    }

    #[test]
    fn test_filter_rendering_per_type() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![
            filter("name", Operator::Equal, many(&["Acme", "O'Reilly"])),
            filter("name", Operator::NotEqual, many(&[])),
            filter("tags", Operator::Contains, many(&["red"])),
            filter("tags", Operator::NotEqual, many(&["red", "blue"])),
            filter("amount", Operator::LessOrEqual, FilterValue::One("42.5".into())),
            filter("amount", Operator::NotEqual, FilterValue::Number(1.0)),
            filter("created", Operator::Greater, FilterValue::One("2024-02-01".into())),
            filter("payload", Operator::Equal, many(&["x"])),
        ];
        let conditions = query(&registry, dict).filter_conditions().unwrap();
        assert_eq!(
            conditions,
            vec![
                "\"name\" IN ('Acme', 'O''Reilly')",
                "\"name\" NOT IN ('')",
                "list_has_any(\"tags\", ['red'])",
                "NOT (list_has_any(\"tags\", ['red', 'blue']))",
                "\"amount\" <= 42.5",
                "\"amount\" <> 1",
                "CAST(\"created\" AS DATE) > '2024-02-01'",
                "1=1",
            ]
        );
    }

    #[test]
    fn test_filters_execute_on_duckdb() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![
            filter("tags", Operator::NotEqual, many(&["red"])),
            filter("created", Operator::Less, FilterValue::One("2024-07-01".into())),
            filter("payload", Operator::Equal, many(&[])),
        ];
        // rows 2, 3 and 4: row 1 overlaps, row 5 is too late
        assert_eq!(query(&registry, dict).row_count().unwrap(), 3);
    }

    #[test]
    fn test_count_statements() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![
            filter("id", Operator::Greater, FilterValue::Number(1.0)),
            filter("id", Operator::Less, FilterValue::Number(5.0)),
        ];
        let q = query(&registry, dict);
        assert_eq!(
            q.row_count_sql().unwrap(),
            "SELECT count(*) FROM \"main\".\"orders\"\nWHERE \"id\" > 1 AND \"id\" < 5"
        );
        assert_eq!(
            q.filter_row_count_sql(1).unwrap(),
            "SELECT count(*) FROM \"main\".\"orders\"\nWHERE \"id\" < 5"
        );
        assert!(matches!(
            q.filter_row_count_sql(2),
            Err(ExplorerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_injection_is_quoted() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![filter(
            "name",
            Operator::Contains,
            many(&["x'; DROP TABLE orders; --"]),
        )];
        let q = query(&registry, dict);
        assert_eq!(q.row_count().unwrap(), 0);
        assert_eq!(Query::new(&registry, "sales").unwrap().row_count().unwrap(), 5);
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_postgres_dialect() {
        use crate::column::{Column, Columns};
        use crate::data_set::DataSet;
        use crate::reader::Backend;
        use std::sync::Arc;

        let columns = Columns::new(vec![
            Column::new("id", SemanticType::Number),
            Column::new("name", SemanticType::Text),
            Column::new("amount", SemanticType::Number),
            Column::new("created", SemanticType::Date),
            Column::new("tags", SemanticType::TextArray),
        ]);

        // Compiled for the row-store backend; nothing is executed
        let postgres = Backend::from_connection_string("postgres://u:p@localhost/db").unwrap();
        let data_set = DataSet::new("sales", "Sales", Arc::new(postgres), "public", "orders")
            .with_default_columns(["id", "name"])
            .with_columns(columns);
        let mut registry = DataSetRegistry::new();
        registry.insert(data_set).unwrap();

        let mut dict = QueryDict::new("sales");
        dict.filters = vec![
            filter("name", Operator::Contains, many(&["acme"])),
            filter("tags", Operator::NotEqual, many(&["a"])),
            filter("created", Operator::GreaterOrEqual, FilterValue::One("2024-01-01".into())),
        ];
        dict.column_names = Some(vec!["id".to_string(), "name".to_string(), "amount".to_string()]);
        dict.sort_column_name = Some("id".to_string());
        dict.sort_order = Some(SortOrder::Desc);
        let sql = query(&registry, dict)
            .compile_select(Some(10), Some(0), ',', false)
            .unwrap()
            .unwrap();

        assert_eq!(
            sql,
            "SELECT \"id\", \"name\", REPLACE(\"amount\"::TEXT, '.', ',') AS \"amount\"
FROM \"public\".\"orders\"
WHERE \"name\" ILIKE ANY(ARRAY['%acme%']::TEXT[]) AND NOT (\"tags\" && ARRAY['a']::TEXT[]) AND \"created\"::DATE >= '2024-01-01'
ORDER BY \"id\" DESC NULLS LAST
LIMIT 10
OFFSET 0"
        );
    }
}

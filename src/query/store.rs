//! Saved queries
//!
//! Queries are stored in one table keyed by `(query_id, data_set_id)`. Saving an
//! existing key updates it in place, keeping who created it and when. Loading builds
//! the query against the data set's current schema, so filters on columns that have
//! since been dropped disappear on load.

use chrono::NaiveDateTime;
use duckdb::{params, OptionalExt};
use serde::Serialize;
use tracing::info;

use crate::data_set::DataSetRegistry;
use crate::query::{slugify, Filter, Query, QueryDict, SortOrder};
use crate::reader::DuckDBReader;
use crate::{ExplorerError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Entry of the list of saved queries of a data set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySummary {
    pub query_id: String,
    pub updated_at: NaiveDateTime,
    pub updated_by: String,
}

/// Persistence of queries
pub trait QueryStore: Send + Sync {
    /// Insert or update the query, recording `user` and `now` as the last change
    fn save(&self, query: &Query, user: &str, now: NaiveDateTime) -> Result<()>;

    /// Load a saved query, validated against the data set's current schema
    ///
    /// `query_id` is slugified first, like the id of a saved query.
    ///
    /// # Errors
    ///
    /// `UnknownQuery` when nothing is stored under the key, `UnknownDataSet` when the
    /// data set is no longer configured.
    fn load(&self, registry: &DataSetRegistry, data_set_id: &str, query_id: &str)
        -> Result<Query>;

    /// Saved queries of a data set, most recently updated first
    fn list(&self, data_set_id: &str) -> Result<Vec<QuerySummary>>;

    /// Remove a saved query; removing one that does not exist is not an error
    fn delete(&self, data_set_id: &str, query_id: &str) -> Result<()>;
}

/// Query store in a DuckDB database
pub struct DuckDBQueryStore {
    reader: DuckDBReader,
}

fn store_error(action: &str, e: impl std::fmt::Display) -> ExplorerError {
    ExplorerError::ReaderError(format!("Failed to {} saved query: {}", action, e))
}

impl DuckDBQueryStore {
    /// Open the store at `uri` (`duckdb://memory` or `duckdb://path`), creating the
    /// table if missing
    pub fn open(uri: &str) -> Result<Self> {
        let reader = DuckDBReader::from_connection_string(uri)?;
        reader.execute_batch(
            "CREATE TABLE IF NOT EXISTS data_set_query (
    query_id VARCHAR NOT NULL,
    data_set_id VARCHAR NOT NULL,
    column_names VARCHAR,
    sort_column_name VARCHAR,
    sort_order VARCHAR,
    filters VARCHAR,
    created_at TIMESTAMP NOT NULL,
    created_by VARCHAR NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    updated_by VARCHAR NOT NULL,
    PRIMARY KEY (query_id, data_set_id)
)",
        )?;
        info!("Opened query store {}", uri);
        Ok(Self { reader })
    }
}

impl QueryStore for DuckDBQueryStore {
    fn save(&self, query: &Query, user: &str, now: NaiveDateTime) -> Result<()> {
        let column_names = serde_json::to_string(query.column_names())
            .map_err(|e| store_error("encode", e))?;
        let filters =
            serde_json::to_string(query.filters()).map_err(|e| store_error("encode", e))?;
        let sort_order = query.sort_order().map(|o| o.as_sql());
        let now = now.format(TIMESTAMP_FORMAT).to_string();

        let conn = self.reader.connection()?;
        conn.execute(
            "INSERT INTO data_set_query (query_id, data_set_id, column_names, sort_column_name,
                            sort_order, filters, created_at, created_by, updated_at, updated_by)
VALUES (?, ?, ?, ?, ?, ?, CAST(? AS TIMESTAMP), ?, CAST(? AS TIMESTAMP), ?)
ON CONFLICT (query_id, data_set_id) DO UPDATE SET
    column_names = EXCLUDED.column_names,
    sort_column_name = EXCLUDED.sort_column_name,
    sort_order = EXCLUDED.sort_order,
    filters = EXCLUDED.filters,
    updated_at = EXCLUDED.updated_at,
    updated_by = EXCLUDED.updated_by",
            params![
                query.query_id(),
                query.data_set().id,
                column_names,
                query.sort_column_name(),
                sort_order,
                filters,
                now,
                user,
                now,
                user
            ],
        )
        .map_err(|e| store_error("save", e))?;

        info!(
            "Saved query '{}' of data set '{}' for {}",
            query.query_id(),
            query.data_set().id,
            user
        );
        Ok(())
    }

    fn load(
        &self,
        registry: &DataSetRegistry,
        data_set_id: &str,
        query_id: &str,
    ) -> Result<Query> {
        let data_set = registry.get(data_set_id)?;
        let query_id = slugify(query_id);

        let stored = {
            let conn = self.reader.connection()?;
            conn.query_row(
                "SELECT column_names, sort_column_name, sort_order, filters,
       strftime(created_at, '%Y-%m-%d %H:%M:%S'), created_by,
       strftime(updated_at, '%Y-%m-%d %H:%M:%S'), updated_by
FROM data_set_query
WHERE data_set_id = ? AND query_id = ?",
                params![data_set_id, query_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| store_error("load", e))?
        };

        let Some((
            column_names,
            sort_column_name,
            sort_order,
            filters,
            created_at,
            created_by,
            updated_at,
            updated_by,
        )) = stored
        else {
            return Err(ExplorerError::UnknownQuery {
                data_set_id: data_set_id.to_string(),
                query_id: query_id.to_string(),
            });
        };

        let column_names = column_names
            .map(|json| serde_json::from_str::<Vec<String>>(&json))
            .transpose()
            .map_err(|e| store_error("decode", e))?;
        let filters = filters
            .map(|json| serde_json::from_str::<Vec<Filter>>(&json))
            .transpose()
            .map_err(|e| store_error("decode", e))?
            .unwrap_or_default();
        let sort_order = match sort_order.as_deref() {
            Some("ASC") => Some(SortOrder::Asc),
            Some("DESC") => Some(SortOrder::Desc),
            _ => None,
        };

        let dict = QueryDict {
            data_set_id: data_set_id.to_string(),
            query_id: query_id.to_string(),
            column_names,
            sort_column_name,
            sort_order,
            filters,
            created_at,
            created_by,
            updated_at,
            updated_by,
        };
        Query::with_data_set(data_set, dict)
    }

    fn list(&self, data_set_id: &str) -> Result<Vec<QuerySummary>> {
        let conn = self.reader.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT query_id, strftime(updated_at, '%Y-%m-%d %H:%M:%S.%f'), updated_by
FROM data_set_query
WHERE data_set_id = ?
ORDER BY updated_at DESC, query_id",
            )
            .map_err(|e| store_error("list", e))?;
        let rows = stmt
            .query_map(params![data_set_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| store_error("list", e))?;

        let mut summaries = Vec::new();
        for row in rows {
            let (query_id, updated_at, updated_by) = row.map_err(|e| store_error("list", e))?;
            let updated_at = NaiveDateTime::parse_from_str(&updated_at, TIMESTAMP_FORMAT)
                .map_err(|e| store_error("decode", e))?;
            summaries.push(QuerySummary {
                query_id,
                updated_at,
                updated_by,
            });
        }
        Ok(summaries)
    }

    fn delete(&self, data_set_id: &str, query_id: &str) -> Result<()> {
        let query_id = slugify(query_id);
        let conn = self.reader.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM data_set_query WHERE data_set_id = ? AND query_id = ?",
                params![data_set_id, query_id],
            )
            .map_err(|e| store_error("delete", e))?;
        if deleted > 0 {
            info!("Deleted query '{}' of data set '{}'", query_id, data_set_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::{filter, many, registry};
    use crate::query::{FilterValue, Operator};
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn store() -> DuckDBQueryStore {
        DuckDBQueryStore::open("duckdb://memory").unwrap()
    }

    fn saved_query(registry: &DataSetRegistry, id: &str) -> Query {
        let mut dict = QueryDict::new("sales");
        dict.query_id = id.to_string();
        dict.column_names = Some(vec!["name".to_string(), "amount".to_string()]);
        dict.sort_column_name = Some("amount".to_string());
        dict.sort_order = Some(SortOrder::Desc);
        dict.filters = vec![
            filter("name", Operator::Contains, many(&["acme"])),
            filter("amount", Operator::Greater, FilterValue::Number(5.0)),
        ];
        Query::from_dict(registry, dict).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let registry = registry();
        let store = store();
        let query = saved_query(&registry, "acme");
        store.save(&query, "alice", at(1, 9)).unwrap();

        let loaded = store.load(&registry, "sales", "acme").unwrap();
        assert_eq!(loaded.column_names(), query.column_names());
        assert_eq!(loaded.filters(), query.filters());
        assert_eq!(loaded.sort_column_name(), Some("amount"));
        assert_eq!(loaded.sort_order(), Some(SortOrder::Desc));
        assert_eq!(loaded.created_at(), Some(at(1, 9)));
        assert_eq!(loaded.created_by(), Some("alice"));
        assert_eq!(loaded.updated_by(), Some("alice"));
    }

    #[test]
    fn test_upsert_keeps_creation() {
        let registry = registry();
        let store = store();
        store
            .save(&saved_query(&registry, "acme"), "alice", at(1, 9))
            .unwrap();

        let mut dict = saved_query(&registry, "acme").to_dict();
        dict.column_names = Some(vec!["id".to_string()]);
        let changed = Query::from_dict(&registry, dict).unwrap();
        store.save(&changed, "bob", at(2, 10)).unwrap();

        let loaded = store.load(&registry, "sales", "acme").unwrap();
        assert_eq!(loaded.column_names(), ["id"]);
        assert_eq!(loaded.created_by(), Some("alice"));
        assert_eq!(loaded.created_at(), Some(at(1, 9)));
        assert_eq!(loaded.updated_by(), Some("bob"));
        assert_eq!(loaded.updated_at(), Some(at(2, 10)));
        assert_eq!(store.list("sales").unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_query() {
        let registry = registry();
        let err = store().load(&registry, "sales", "nope").unwrap_err();
        assert!(matches!(err, ExplorerError::UnknownQuery { .. }));
    }

    #[test]
    fn test_load_revalidates_against_schema() {
        let registry = registry();
        let store = store();
        {
            let conn = store.reader.connection().unwrap();
            conn.execute(
                "INSERT INTO data_set_query VALUES ('old', 'sales', '[\"name\", \"dropped\"]', 'dropped',
                    'ASC', '[{\"column_name\": \"dropped\", \"operator\": \"=\", \"value\": [\"x\"]}]',
                    TIMESTAMP '2024-01-01 00:00:00', 'carol', TIMESTAMP '2024-01-01 00:00:00', 'carol')",
                params![],
            )
            .unwrap();
        }
        let loaded = store.load(&registry, "sales", "old").unwrap();
        assert_eq!(loaded.column_names(), ["name"]);
        assert_eq!(loaded.sort_column_name(), None);
        assert!(loaded.filters().is_empty());
    }

    #[test]
    fn test_list_orders_by_update() {
        let registry = registry();
        let store = store();
        store.save(&saved_query(&registry, "b"), "alice", at(1, 9)).unwrap();
        store.save(&saved_query(&registry, "c"), "bob", at(3, 9)).unwrap();
        store.save(&saved_query(&registry, "a"), "carol", at(1, 9)).unwrap();

        let ids: Vec<String> = store
            .list("sales")
            .unwrap()
            .into_iter()
            .map(|s| s.query_id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(store.list("other").unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = registry();
        let store = store();
        store.save(&saved_query(&registry, "a"), "alice", at(1, 9)).unwrap();

        store.delete("sales", "a").unwrap();
        store.delete("sales", "a").unwrap();
        assert!(store.list("sales").unwrap().is_empty());
    }

    #[test]
    fn test_load_and_delete_by_display_name() {
        let registry = registry();
        let store = store();
        store
            .save(&saved_query(&registry, "Big Acme"), "alice", at(1, 9))
            .unwrap();

        let loaded = store.load(&registry, "sales", "Big Acme").unwrap();
        assert_eq!(loaded.query_id(), "big-acme");
        assert!(store.load(&registry, "sales", "big-acme").is_ok());

        store.delete("sales", "Big Acme").unwrap();
        assert!(store.list("sales").unwrap().is_empty());
    }
}

//! Distributions of a column under a query's filters
//!
//! Numbers and dates get a histogram whose bucket size adapts to the value range,
//! text and text arrays get their ten most frequent values. Every statement starts
//! from the same `query` CTE: the column's non-null values under the query's filters.

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::Serialize;

use crate::column::{Column, SemanticType};
use crate::query::Query;
use crate::reader::{Dialect, Reader};
use crate::value::ResultSet;
use crate::{ExplorerError, Result};

/// A histogram has at least this many buckets, unless all values are equal
pub const MIN_BUCKETS: i64 = 5;

/// Number of values in a frequency table
pub const TOP_VALUES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericBucket {
    pub min: f64,
    /// Exclusive, except for the single bucket of a constant column
    pub max: f64,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateBucket {
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frequency {
    pub label: String,
    pub count: i64,
}

/// Calendar period of a date histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Year,
    Month,
    Week,
    Day,
}

impl Resolution {
    /// Coarsest first
    const ALL: [Resolution; 4] = [
        Resolution::Year,
        Resolution::Month,
        Resolution::Week,
        Resolution::Day,
    ];

    /// Unit name for `date_trunc` and intervals
    pub fn unit(&self) -> &'static str {
        match self {
            Resolution::Year => "year",
            Resolution::Month => "month",
            Resolution::Week => "week",
            Resolution::Day => "day",
        }
    }

    /// Start of the period containing `date`; weeks start on Monday
    pub fn truncate(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Resolution::Year => date.with_ordinal(1).unwrap_or(date),
            Resolution::Month => date.with_day(1).unwrap_or(date),
            Resolution::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            Resolution::Day => date,
        }
    }

    /// Start of the period after the one starting at `start`
    pub fn next(&self, start: NaiveDate) -> NaiveDate {
        match self {
            Resolution::Year => start.checked_add_months(Months::new(12)),
            Resolution::Month => start.checked_add_months(Months::new(1)),
            Resolution::Week => start.checked_add_signed(Duration::days(7)),
            Resolution::Day => start.checked_add_signed(Duration::days(1)),
        }
        .unwrap_or(start)
    }

    /// Number of periods from the one containing `min` to the one containing `max`
    pub fn periods(&self, min: NaiveDate, max: NaiveDate) -> i64 {
        match self {
            Resolution::Year => (max.year() - min.year()) as i64 + 1,
            Resolution::Month => {
                let months = |d: NaiveDate| d.year() as i64 * 12 + d.month0() as i64;
                months(max) - months(min) + 1
            }
            Resolution::Week => {
                (self.truncate(max) - self.truncate(min)).num_days() / 7 + 1
            }
            Resolution::Day => (max - min).num_days() + 1,
        }
    }

    /// The coarsest resolution giving at least [`MIN_BUCKETS`] periods, days otherwise
    pub fn choose(min: NaiveDate, max: NaiveDate) -> Resolution {
        Resolution::ALL
            .into_iter()
            .find(|r| r.periods(min, max) >= MIN_BUCKETS)
            .unwrap_or(Resolution::Day)
    }
}

/// Histogram or frequency table of one column
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Distribution {
    Numeric(Vec<NumericBucket>),
    Temporal {
        resolution: Resolution,
        buckets: Vec<DateBucket>,
    },
    Frequencies(Vec<Frequency>),
    /// The column type has no distribution (json)
    Unavailable,
}

impl Distribution {
    /// Sum of all counts
    pub fn total(&self) -> i64 {
        match self {
            Distribution::Numeric(buckets) => buckets.iter().map(|b| b.count).sum(),
            Distribution::Temporal { buckets, .. } => buckets.iter().map(|b| b.count).sum(),
            Distribution::Frequencies(values) => values.iter().map(|v| v.count).sum(),
            Distribution::Unavailable => 0,
        }
    }
}

/// Bucket width as a power of ten: starting from the magnitude of the largest absolute
/// value, the exponent goes down until more than [`MIN_BUCKETS`] buckets cover the range.
/// Returns the width and the number of buckets.
pub fn bucket_width(min: f64, max: f64) -> (f64, i64) {
    let magnitude = min.abs().max(max.abs());
    let mut exponent = magnitude.log10().floor() as i32;
    let mut width = 10f64.powi(exponent);
    let mut count = ((max - min) / width).floor() as i64 + 1;
    // A few hundred steps cover the whole f64 range
    for _ in 0..700 {
        if count > MIN_BUCKETS {
            break;
        }
        exponent -= 1;
        width = 10f64.powi(exponent);
        count = ((max - min) / width).floor() as i64 + 1;
    }
    (width, count)
}

impl Query {
    /// Distribution of `column_name` under the query's filters
    ///
    /// # Errors
    ///
    /// `ValidationError` for a column the data set does not have, `PermissionDenied` for
    /// a personal data column when `redact_personal_data` is set.
    pub fn distribution(&self, column_name: &str, redact_personal_data: bool) -> Result<Distribution> {
        let data_set = self.data_set();
        let column = data_set.column(column_name)?.cloned().ok_or_else(|| {
            ExplorerError::ValidationError(format!(
                "Data set '{}' has no column '{}'",
                data_set.id, column_name
            ))
        })?;
        self.distribution_of(&column, redact_personal_data)
    }

    /// Distribution of the column at `pos` in the data set's table order
    pub fn distribution_at(&self, pos: usize, redact_personal_data: bool) -> Result<Distribution> {
        let data_set = self.data_set();
        let column = data_set.columns()?.at(pos).cloned().ok_or_else(|| {
            ExplorerError::ValidationError(format!(
                "Data set '{}' has no column at position {}",
                data_set.id, pos
            ))
        })?;
        self.distribution_of(&column, redact_personal_data)
    }

    fn distribution_of(&self, column: &Column, redact_personal_data: bool) -> Result<Distribution> {
        if redact_personal_data && self.data_set().is_personal_data(&column.name) {
            return Err(ExplorerError::PermissionDenied(format!(
                "Column '{}' contains personal data",
                column.name
            )));
        }
        match column.semantic_type {
            SemanticType::Number => self.number_distribution(&column.name),
            SemanticType::Date => self.date_distribution(&column.name),
            SemanticType::Text => self.text_distribution(&column.name, false),
            SemanticType::TextArray => self.text_distribution(&column.name, true),
            SemanticType::Json => Ok(Distribution::Unavailable),
        }
    }

    fn dialect(&self) -> Dialect {
        self.data_set().backend().dialect()
    }

    fn execute(&self, sql: &str) -> Result<ResultSet> {
        self.data_set().backend().execute(sql)
    }

    /// `query AS (...)` CTE: non-null values of the column under all filters
    fn query_cte(&self, column_name: &str) -> Result<String> {
        let quoted = self.dialect().quote_identifier(column_name);
        let mut conditions = vec![format!("{} IS NOT NULL", quoted)];
        conditions.extend(self.filter_conditions()?);
        Ok(format!(
            "query AS (SELECT {} AS value\n  FROM {}\n  WHERE {})",
            quoted,
            self.data_set().table_ref(),
            conditions.join("\n    AND ")
        ))
    }

    fn number_distribution(&self, column_name: &str) -> Result<Distribution> {
        let dialect = self.dialect();
        let cte = self.query_cte(column_name)?;

        let stats = self.execute(&format!(
            "WITH\n{}\nSELECT {}, {}, count(*) FROM query",
            cte,
            dialect.cast_float("min(value)"),
            dialect.cast_float("max(value)")
        ))?;
        let row = stats.rows.first();
        let cell = |i: usize| row.and_then(|r| r.get(i));
        let count = cell(2).and_then(|v| v.as_i64()).unwrap_or(0);
        let (Some(min), Some(max)) = (
            cell(0).and_then(|v| v.as_f64()),
            cell(1).and_then(|v| v.as_f64()),
        ) else {
            return Ok(Distribution::Numeric(Vec::new()));
        };
        if count == 0 {
            return Ok(Distribution::Numeric(Vec::new()));
        }
        if min == max {
            return Ok(Distribution::Numeric(vec![NumericBucket { min, max, count }]));
        }

        let (width, buckets) = bucket_width(min, max);
        let last = buckets - 1;
        let sql = format!(
            "WITH
{cte},
buckets AS (SELECT i FROM generate_series(0, {last}) AS t(i)),
histogram AS (SELECT LEAST(CAST(floor(({value} - {min}) / {width}) AS INTEGER), {last}) AS bucket,
                     count(*) AS count
              FROM query
              GROUP BY 1)
SELECT i, coalesce(histogram.count, 0) AS count
FROM buckets
LEFT JOIN histogram ON histogram.bucket = buckets.i
ORDER BY i",
            value = dialect.cast_float("value"),
        );

        let result = self.execute(&sql)?;
        let buckets = result
            .rows
            .iter()
            .filter_map(|row| {
                let i = row.first()?.as_i64()?;
                let count = row.get(1)?.as_i64()?;
                let lower = min + i as f64 * width;
                Some(NumericBucket {
                    min: lower,
                    max: lower + width,
                    count,
                })
            })
            .collect();
        Ok(Distribution::Numeric(buckets))
    }

    fn date_distribution(&self, column_name: &str) -> Result<Distribution> {
        let dialect = self.dialect();
        let cte = self.query_cte(column_name)?;
        let value = dialect.cast_date("value");

        let stats = self.execute(&format!(
            "WITH\n{}\nSELECT min({}), max({}) FROM query",
            cte, value, value
        ))?;
        let row = stats.rows.first();
        let (Some(min), Some(max)) = (
            row.and_then(|r| r.first()).and_then(|v| v.as_date()),
            row.and_then(|r| r.get(1)).and_then(|v| v.as_date()),
        ) else {
            return Ok(Distribution::Temporal {
                resolution: Resolution::Day,
                buckets: Vec::new(),
            });
        };

        let resolution = Resolution::choose(min, max);
        let unit = resolution.unit();
        let sql = format!(
            "WITH
{cte},
periods AS (SELECT {period} AS period
            FROM generate_series({first}, {last}, INTERVAL '1 {unit}') AS t(p)),
histogram AS (SELECT {truncated} AS period, count(*) AS count
              FROM query
              GROUP BY 1)
SELECT periods.period, coalesce(histogram.count, 0) AS count
FROM periods
LEFT JOIN histogram ON histogram.period = periods.period
ORDER BY periods.period",
            period = dialect.cast_date("p"),
            first = dialect.timestamp_literal(resolution.truncate(min)),
            last = dialect.timestamp_literal(resolution.truncate(max)),
            truncated = dialect.cast_date(&format!("date_trunc('{}', {})", unit, value)),
        );

        let result = self.execute(&sql)?;
        let buckets = result
            .rows
            .iter()
            .filter_map(|row| {
                let start = row.first()?.as_date()?;
                let count = row.get(1)?.as_i64()?;
                Some(DateBucket {
                    start,
                    end: resolution.next(start),
                    count,
                })
            })
            .collect();
        Ok(Distribution::Temporal {
            resolution,
            buckets,
        })
    }

    /// Most frequent values; array columns are flattened first
    fn text_distribution(&self, column_name: &str, flatten: bool) -> Result<Distribution> {
        let dialect = self.dialect();
        let cte = self.query_cte(column_name)?;
        let source = if flatten {
            "(SELECT unnest(value) AS value FROM query) t"
        } else {
            "query"
        };
        let sql = format!(
            "WITH
{cte}
SELECT {label} AS label, count(*) AS count
FROM {source}
WHERE value IS NOT NULL
GROUP BY 1
ORDER BY 2 DESC, 1
LIMIT {limit}",
            label = dialect.cast_text("value"),
            limit = TOP_VALUES,
        );

        let result = self.execute(&sql)?;
        let values = result
            .rows
            .iter()
            .filter_map(|row| {
                Some(Frequency {
                    label: row.first()?.to_string(),
                    count: row.get(1)?.as_i64()?,
                })
            })
            .collect();
        Ok(Distribution::Frequencies(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::{filter, many, registry};
    use crate::query::{FilterValue, Operator, QueryDict};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_bucket_width() {
        assert_eq!(bucket_width(0.0, 100.0), (10.0, 11));
        assert_eq!(bucket_width(10.0, 42.0), (1.0, 33));
        let (width, count) = bucket_width(1000.0, 1001.0);
        assert!((width - 0.1).abs() < 1e-12);
        assert!(count > MIN_BUCKETS);
    }

    #[test]
    fn test_resolution_choice() {
        assert_eq!(Resolution::choose(date(2019, 6, 1), date(2024, 1, 1)), Resolution::Year);
        assert_eq!(Resolution::choose(date(2024, 1, 5), date(2024, 9, 1)), Resolution::Month);
        assert_eq!(Resolution::choose(date(2024, 1, 1), date(2024, 2, 10)), Resolution::Week);
        assert_eq!(Resolution::choose(date(2024, 1, 1), date(2024, 1, 8)), Resolution::Day);
        assert_eq!(Resolution::choose(date(2024, 1, 1), date(2024, 1, 1)), Resolution::Day);
        assert_eq!(Resolution::Week.truncate(date(2024, 1, 10)), date(2024, 1, 8));
        assert_eq!(Resolution::Month.next(date(2024, 12, 1)), date(2025, 1, 1));
    }

    #[test]
    fn test_number_distribution() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        let Distribution::Numeric(buckets) = query.distribution("amount", false).unwrap() else {
            panic!("expected a numeric distribution");
        };
        // 10..=42 with width 1
        assert_eq!(buckets.len(), 33);
        assert_eq!(buckets[0], NumericBucket { min: 10.0, max: 11.0, count: 1 });
        assert_eq!(buckets[1].count, 0);
        assert_eq!(buckets[32], NumericBucket { min: 42.0, max: 43.0, count: 2 });
        assert_eq!(buckets.iter().map(|b| b.count).sum::<i64>(), 5);
    }

    #[test]
    fn test_number_distribution_of_constant_values() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![filter("amount", Operator::Equal, FilterValue::Number(42.0))];
        let query = Query::from_dict(&registry, dict).unwrap();
        assert_eq!(
            query.distribution("amount", false).unwrap(),
            Distribution::Numeric(vec![NumericBucket { min: 42.0, max: 42.0, count: 2 }])
        );
    }

    #[test]
    fn test_number_distribution_without_rows() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![filter("amount", Operator::Less, FilterValue::Number(0.0))];
        let query = Query::from_dict(&registry, dict).unwrap();
        assert_eq!(
            query.distribution("amount", false).unwrap(),
            Distribution::Numeric(Vec::new())
        );
    }

    #[test]
    fn test_distribution_matches_row_count() {
        let registry = registry();
        let mut dict = QueryDict::new("sales");
        dict.filters = vec![filter("name", Operator::Contains, many(&["c"]))];
        let query = Query::from_dict(&registry, dict).unwrap();

        let rows = query.row_count().unwrap();
        assert_eq!(rows, 3);
        assert_eq!(query.distribution("amount", false).unwrap().total(), rows);
        assert_eq!(query.distribution("created", false).unwrap().total(), rows);
        assert_eq!(query.distribution("name", false).unwrap().total(), rows);
    }

    #[test]
    fn test_date_distribution() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        let Distribution::Temporal { resolution, buckets } =
            query.distribution("created", false).unwrap()
        else {
            panic!("expected a date distribution");
        };
        assert_eq!(resolution, Resolution::Month);
        // January to September, empty months included
        assert_eq!(buckets.len(), 9);
        assert_eq!(
            buckets[0],
            DateBucket { start: date(2024, 1, 1), end: date(2024, 2, 1), count: 1 }
        );
        assert_eq!(buckets[3].count, 0);
        assert_eq!(buckets[8].start, date(2024, 9, 1));
    }

    #[test]
    fn test_text_distribution() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        let Distribution::Frequencies(values) = query.distribution("name", false).unwrap() else {
            panic!("expected frequencies");
        };
        assert_eq!(values.len(), 5);
        assert!(values.iter().all(|v| v.count == 1));
        // ties ordered by label
        assert_eq!(values[0].label, "Acme");
    }

    #[test]
    fn test_text_array_distribution_flattens() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        assert_eq!(
            query.distribution("tags", false).unwrap(),
            Distribution::Frequencies(vec![
                Frequency { label: "blue".to_string(), count: 2 },
                Frequency { label: "green".to_string(), count: 1 },
                Frequency { label: "red".to_string(), count: 1 },
            ])
        );
    }

    #[test]
    fn test_json_distribution_is_unavailable() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        assert_eq!(
            query.distribution("payload", false).unwrap(),
            Distribution::Unavailable
        );
    }

    #[test]
    fn test_personal_data_distribution_is_refused_when_redacting() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        assert!(matches!(
            query.distribution("email", true),
            Err(ExplorerError::PermissionDenied(_))
        ));
        assert!(query.distribution("email", false).is_ok());
    }

    #[test]
    fn test_distribution_by_position() {
        let registry = registry();
        let query = Query::new(&registry, "sales").unwrap();
        // position 1 is "name"
        assert!(matches!(
            query.distribution_at(1, false).unwrap(),
            Distribution::Frequencies(_)
        ));
        assert!(matches!(
            query.distribution_at(99, false),
            Err(ExplorerError::ValidationError(_))
        ));
        assert!(matches!(
            query.distribution("gone", false),
            Err(ExplorerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Distribution::Temporal {
            resolution: Resolution::Week,
            buckets: vec![DateBucket { start: date(2024, 1, 1), end: date(2024, 1, 8), count: 3 }],
        })
        .unwrap();
        assert_eq!(json["kind"], "temporal");
        assert_eq!(json["data"]["resolution"], "week");
        assert_eq!(json["data"]["buckets"][0]["start"], "2024-01-01");
    }
}

//! Fallback queries straight over `page_views`.
//!
//! Used when no summary scope covers a query or the range was never
//! aggregated. Results must match what the summary path would return for
//! the same data.

use anyhow::Result;
use chrono::NaiveDate;

use viewstats_core::analytics::{BucketTotals, Granularity, QueryFilter, RangeResult};
use viewstats_core::summary::Dimension;

use crate::backend::parse_day;
use crate::DuckDbBackend;

type SqlParams = Vec<Box<dyn duckdb::types::ToSql>>;

/// `WHERE` clause for `filter`, with the date bounds at `?1` and `?2`.
fn filter_clause(filter: &QueryFilter) -> (String, SqlParams) {
    let start_str = filter.range.start.format("%Y-%m-%d").to_string();
    let end_next = filter.range.end + chrono::Duration::days(1);
    let end_str = end_next.format("%Y-%m-%d").to_string();

    let mut sql = String::from(
        "viewed_at >= CAST(?1 AS TIMESTAMP) AND viewed_at < CAST(?2 AS TIMESTAMP)",
    );
    let mut params: SqlParams = vec![Box::new(start_str), Box::new(end_str)];
    let mut idx = 3;

    let mut placeholders = |codes: &[String], params: &mut SqlParams| {
        let mut list = Vec::with_capacity(codes.len());
        for code in codes {
            list.push(format!("?{}", idx));
            params.push(Box::new(code.clone()));
            idx += 1;
        }
        list.join(", ")
    };

    if !filter.country_codes.is_empty() {
        let list = placeholders(&filter.country_codes, &mut params);
        sql.push_str(&format!(" AND country_code IN ({list})"));
    }
    if !filter.exclude_country_codes.is_empty() {
        let list = placeholders(&filter.exclude_country_codes, &mut params);
        // Unknown countries are never excluded.
        sql.push_str(&format!(
            " AND (country_code IS NULL OR country_code NOT IN ({list}))"
        ));
    }

    for (column, value) in [
        ("author", &filter.author),
        ("content_type", &filter.content_type),
        ("content_id", &filter.content_id),
    ] {
        if let Some(value) = value {
            let list = placeholders(std::slice::from_ref(value), &mut params);
            sql.push_str(&format!(" AND {column} = {list}"));
        }
    }

    (sql, params)
}

impl DuckDbBackend {
    /// `{x, y, z}` per value of `dimension`; rows with no value are dropped.
    pub async fn scan_grouped(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> Result<Vec<RangeResult>> {
        let column = dimension.column();
        // Params are not `Send`; build them only once the guard is held.
        let conn = self.conn.lock().await;
        let (where_sql, params) = filter_clause(filter);
        let sql = format!(
            r#"
            SELECT {column} AS x,
                   COUNT(DISTINCT content_id) AS y,
                   COUNT(*) AS z
            FROM page_views
            WHERE {where_sql}
              AND {column} IS NOT NULL
              AND {column} <> ''
            GROUP BY x
            "#
        );

        let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(RangeResult {
                x: row.get(0)?,
                y: row.get::<_, i64>(1)? as u64,
                z: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn scan_day_bounds(&self, filter: &QueryFilter) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let conn = self.conn.lock().await;
        let (where_sql, params) = filter_clause(filter);
        let sql = format!(
            r#"
            SELECT CAST(CAST(MIN(viewed_at) AS DATE) AS VARCHAR),
                   CAST(CAST(MAX(viewed_at) AS DATE) AS VARCHAR)
            FROM page_views
            WHERE {where_sql}
            "#
        );

        let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let (first, last): (Option<String>, Option<String>) = conn
            .prepare(&sql)?
            .query_row(param_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?;

        match (first, last) {
            (Some(first), Some(last)) => Ok(Some((parse_day(&first)?, parse_day(&last)?))),
            _ => Ok(None),
        }
    }

    /// Views and distinct items per bucket, ordered by bucket. DuckDB weeks
    /// start on Monday, matching [`Granularity::bucket_start`].
    pub async fn scan_buckets(
        &self,
        filter: &QueryFilter,
        granularity: Granularity,
    ) -> Result<Vec<BucketTotals>> {
        let trunc = granularity.as_str();
        let conn = self.conn.lock().await;
        let (where_sql, params) = filter_clause(filter);
        let sql = format!(
            r#"
            SELECT CAST(CAST(date_trunc('{trunc}', viewed_at) AS DATE) AS VARCHAR) AS bucket,
                   COUNT(*) AS views,
                   COUNT(DISTINCT content_id) AS items
            FROM page_views
            WHERE {where_sql}
            GROUP BY bucket
            ORDER BY bucket
            "#
        );

        let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut buckets = Vec::new();
        for row in rows {
            let (bucket, views, items) = row?;
            buckets.push(BucketTotals {
                bucket: parse_day(&bucket)?,
                views: views as u64,
                items: items as u64,
            });
        }
        Ok(buckets)
    }
}

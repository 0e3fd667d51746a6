//! Daily summary rows and the aggregation run ledger.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{NaiveDate, Utc};

use viewstats_core::sketch::DistinctItems;
use viewstats_core::summary::{DailySummary, DayRange, GroupKey};

use crate::backend::{format_timestamp, parse_day};
use crate::DuckDbBackend;

impl DuckDbBackend {
    pub async fn summary_keys_for_day(&self, scope: &str, day: NaiveDate) -> Result<Vec<GroupKey>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT country_code, author, content_type, content_id
               FROM daily_summaries
               WHERE scope = ?1 AND day = CAST(?2 AS DATE)"#,
        )?;
        let rows = stmt.query_map(
            duckdb::params![scope, day.format("%Y-%m-%d").to_string()],
            |row| {
                Ok(GroupKey {
                    country_code: row.get(0)?,
                    author: row.get(1)?,
                    content_type: row.get(2)?,
                    content_id: row.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Replace every summary row of `(scope, day)` and upsert the ledger
    /// entry, all in one transaction. Readers see the old day or the new day,
    /// never a mix.
    pub async fn replace_day(&self, scope: &str, day: NaiveDate, rows: &[DailySummary]) -> Result<()> {
        let day_str = day.format("%Y-%m-%d").to_string();
        let total_views: u64 = rows.iter().map(|r| r.total_views).sum();

        // Encode before taking the connection so a bad row never opens a tx.
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            encoded.push((row, row.items.exact_json()?, row.items.sketch_base64()));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM daily_summaries WHERE scope = ?1 AND day = CAST(?2 AS DATE)",
            duckdb::params![scope, day_str],
        )?;
        for (row, item_ids, item_sketch) in &encoded {
            tx.execute(
                r#"INSERT INTO daily_summaries (
                    scope, day, country_code, author, content_type, content_id,
                    total_views, unique_items, item_ids, item_sketch
                ) VALUES (?1, CAST(?2 AS DATE), ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                duckdb::params![
                    scope,
                    day_str,
                    row.key.country_code,
                    row.key.author,
                    row.key.content_type,
                    row.key.content_id,
                    row.total_views as i64,
                    row.unique_items as i64,
                    item_ids,
                    item_sketch,
                ],
            )?;
        }
        tx.execute(
            r#"INSERT INTO aggregation_runs (scope, day, rows_written, total_views, completed_at)
               VALUES (?1, CAST(?2 AS DATE), ?3, ?4, CAST(?5 AS TIMESTAMP))
               ON CONFLICT (scope, day) DO UPDATE SET
                   rows_written = EXCLUDED.rows_written,
                   total_views = EXCLUDED.total_views,
                   completed_at = EXCLUDED.completed_at"#,
            duckdb::params![
                scope,
                day_str,
                rows.len() as i64,
                total_views as i64,
                format_timestamp(&Utc::now()),
            ],
        )?;
        tx.commit()?;
        tracing::info!(scope, day = %day, rows = rows.len(), total_views, "Day summaries replaced");
        Ok(())
    }

    /// Summary rows of `scope` in `range`, ordered by day then key.
    pub async fn load_summaries(&self, scope: &str, range: DayRange) -> Result<Vec<DailySummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT CAST(day AS VARCHAR), country_code, author, content_type, content_id,
                      total_views, unique_items, item_ids, item_sketch
               FROM daily_summaries
               WHERE scope = ?1
                 AND day >= CAST(?2 AS DATE)
                 AND day <= CAST(?3 AS DATE)
               ORDER BY day, country_code, author, content_type, content_id"#,
        )?;
        let rows = stmt.query_map(
            duckdb::params![
                scope,
                range.start.format("%Y-%m-%d").to_string(),
                range.end.format("%Y-%m-%d").to_string(),
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    GroupKey {
                        country_code: row.get(1)?,
                        author: row.get(2)?,
                        content_type: row.get(3)?,
                        content_id: row.get(4)?,
                    },
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )?;

        let mut summaries = Vec::new();
        for row in rows {
            let (day, key, total_views, unique_items, item_ids, item_sketch) = row?;
            summaries.push(DailySummary {
                scope: scope.to_string(),
                day: parse_day(&day)?,
                key,
                total_views: total_views.max(0) as u64,
                unique_items: unique_items.max(0) as u64,
                items: DistinctItems::from_columns(item_ids.as_deref(), item_sketch.as_deref())?,
            });
        }
        Ok(summaries)
    }

    /// Days in `range` with a ledger entry for `scope`.
    pub async fn aggregated_days(&self, scope: &str, range: DayRange) -> Result<BTreeSet<NaiveDate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT CAST(day AS VARCHAR)
               FROM aggregation_runs
               WHERE scope = ?1
                 AND day >= CAST(?2 AS DATE)
                 AND day <= CAST(?3 AS DATE)"#,
        )?;
        let rows = stmt.query_map(
            duckdb::params![
                scope,
                range.start.format("%Y-%m-%d").to_string(),
                range.end.format("%Y-%m-%d").to_string(),
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut days = BTreeSet::new();
        for row in rows {
            days.insert(parse_day(&row?)?);
        }
        Ok(days)
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use viewstats_core::event::PageView;

use crate::schema::init_sql;

/// A DuckDB backend for viewstats.
///
/// DuckDB is single-writer, so the connection sits behind `Arc<Mutex<_>>`:
/// every read and write is serialised through the async mutex while the
/// backend stays cheap to share between the engine, the query service and
/// the lock.
///
/// Memory and thread limits are enforced by [`init_sql`] at open time.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"1GB"` or `"512MB"`.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open DuckDB at {path}"))?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** DuckDB database. Data is discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a batch of page views in a single transaction.
    ///
    /// Returns immediately (no-op) if `views` is empty.
    pub async fn insert_events(&self, views: &[PageView]) -> Result<()> {
        if views.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for view in views {
            tx.execute(
                r#"INSERT INTO page_views (
                    id, viewed_at, country_code, author, content_id, content_type
                ) VALUES (?1, CAST(?2 AS TIMESTAMP), ?3, ?4, ?5, ?6)"#,
                duckdb::params![
                    view.id,
                    format_timestamp(&view.viewed_at),
                    view.country_code,
                    view.author,
                    view.content_id,
                    view.content_type,
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!("Inserted {} page views into DuckDB", views.len());
        Ok(())
    }

    /// Page views of one UTC day, ordered by time then id.
    pub async fn events_for_day(&self, day: NaiveDate) -> Result<Vec<PageView>> {
        let start = day.format("%Y-%m-%d").to_string();
        let end = (day + chrono::Duration::days(1)).format("%Y-%m-%d").to_string();

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT id, CAST(viewed_at AS VARCHAR), country_code, author, content_id, content_type
               FROM page_views
               WHERE viewed_at >= CAST(?1 AS TIMESTAMP)
                 AND viewed_at < CAST(?2 AS TIMESTAMP)
               ORDER BY viewed_at, id"#,
        )?;
        let rows = stmt.query_map(duckdb::params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut views = Vec::new();
        for row in rows {
            let (id, viewed_at, country_code, author, content_id, content_type) = row?;
            views.push(PageView {
                id,
                viewed_at: parse_timestamp(&viewed_at)?,
                country_code,
                author,
                content_id,
                content_type,
            });
        }
        Ok(views)
    }

    pub async fn earliest_event_day(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().await;
        let earliest: Option<String> = conn.query_row(
            "SELECT CAST(CAST(MIN(viewed_at) AS DATE) AS VARCHAR) FROM page_views",
            [],
            |row| row.get(0),
        )?;
        earliest.as_deref().map(parse_day).transpose()
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the DuckDB connection lock for direct queries.
    ///
    /// Intended for integration tests that need to verify stored data.
    /// Production code should use the typed methods.
    pub async fn conn_for_test(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Parse DuckDB's `CAST(ts AS VARCHAR)` output as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .with_context(|| format!("unparseable timestamp '{raw}'"))?;
    Ok(naive.and_utc())
}

pub(crate) fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("unparseable date '{raw}'"))
}

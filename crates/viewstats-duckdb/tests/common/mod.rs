#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use viewstats_core::analytics::{
    AnalyticsStore, BucketTotals, Granularity, QueryFilter, RangeResult,
};
use viewstats_core::event::PageView;
use viewstats_core::summary::{DailySummary, DayRange, Dimension, GroupKey};
use viewstats_duckdb::DuckDbBackend;

pub fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).expect("date")
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0)
        .single()
        .expect("ts")
}

pub fn view(day: u32, country: Option<&str>, author: &str, item: &str) -> PageView {
    PageView::new(at(day, 12), country, author, item, "blog")
}

pub fn range(start: u32, end: u32) -> DayRange {
    DayRange::new(d(start), d(end)).expect("range")
}

pub async fn seeded(views: &[PageView]) -> Arc<DuckDbBackend> {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    db.insert_events(views).await.expect("insert");
    db
}

/// Every summary row of `scope` as raw column text, ordered.
pub async fn dump_summaries(db: &DuckDbBackend, scope: &str) -> Vec<Vec<Option<String>>> {
    let conn = db.conn_for_test().await;
    let mut stmt = conn
        .prepare(
            "SELECT CAST(day AS VARCHAR), country_code, author, content_type, content_id,
                    CAST(total_views AS VARCHAR), CAST(unique_items AS VARCHAR), item_ids, item_sketch
             FROM daily_summaries
             WHERE scope = ?1
             ORDER BY day, country_code, author, content_type, content_id",
        )
        .expect("prepare");
    let rows = stmt
        .query_map(viewstats_duckdb::duckdb::params![scope], |row| {
            (0..9)
                .map(|i| row.get::<_, Option<String>>(i))
                .collect::<Result<Vec<_>, _>>()
        })
        .expect("query");
    rows.collect::<Result<Vec<_>, _>>().expect("rows")
}

/// Wraps the DuckDB store to inject failures and delays and count writes.
pub struct WrappedStore {
    pub inner: Arc<DuckDbBackend>,
    pub fail_day: Option<NaiveDate>,
    pub load_delay: Duration,
    pub ping_fails: bool,
    pub replace_calls: AtomicUsize,
}

impl WrappedStore {
    pub fn new(inner: Arc<DuckDbBackend>) -> Self {
        Self {
            inner,
            fail_day: None,
            load_delay: Duration::ZERO,
            ping_fails: false,
            replace_calls: AtomicUsize::new(0),
        }
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyticsStore for WrappedStore {
    async fn insert_events(&self, views: &[PageView]) -> anyhow::Result<()> {
        self.inner.insert_events(views).await
    }

    async fn events_for_day(&self, day: NaiveDate) -> anyhow::Result<Vec<PageView>> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.inner.events_for_day(day).await
    }

    async fn earliest_event_day(&self) -> anyhow::Result<Option<NaiveDate>> {
        self.inner.earliest_event_day().await
    }

    async fn summary_keys_for_day(
        &self,
        scope: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<GroupKey>> {
        self.inner.summary_keys_for_day(scope, day).await
    }

    async fn replace_day(
        &self,
        scope: &str,
        day: NaiveDate,
        rows: &[DailySummary],
    ) -> anyhow::Result<()> {
        if self.fail_day == Some(day) {
            return Err(anyhow!("disk full while writing {day}"));
        }
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_day(scope, day, rows).await
    }

    async fn load_summaries(
        &self,
        scope: &str,
        range: DayRange,
    ) -> anyhow::Result<Vec<DailySummary>> {
        self.inner.load_summaries(scope, range).await
    }

    async fn aggregated_days(
        &self,
        scope: &str,
        range: DayRange,
    ) -> anyhow::Result<BTreeSet<NaiveDate>> {
        self.inner.aggregated_days(scope, range).await
    }

    async fn scan_grouped(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> anyhow::Result<Vec<RangeResult>> {
        self.inner.scan_grouped(dimension, filter).await
    }

    async fn scan_day_bounds(
        &self,
        filter: &QueryFilter,
    ) -> anyhow::Result<Option<(NaiveDate, NaiveDate)>> {
        self.inner.scan_day_bounds(filter).await
    }

    async fn scan_buckets(
        &self,
        filter: &QueryFilter,
        granularity: Granularity,
    ) -> anyhow::Result<Vec<BucketTotals>> {
        self.inner.scan_buckets(filter, granularity).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        if self.ping_fails {
            return Err(anyhow!("connection refused"));
        }
        self.inner.ping().await
    }
}

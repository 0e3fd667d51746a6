use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;

use viewstats_core::analytics::{
    AnalyticsStore, BucketTotals, Granularity, QueryFilter, RangeResult,
};
use viewstats_core::event::PageView;
use viewstats_core::summary::{DailySummary, DayRange, Dimension, GroupKey};

use crate::DuckDbBackend;

#[async_trait]
impl AnalyticsStore for DuckDbBackend {
    async fn insert_events(&self, views: &[PageView]) -> anyhow::Result<()> {
        DuckDbBackend::insert_events(self, views).await
    }

    async fn events_for_day(&self, day: NaiveDate) -> anyhow::Result<Vec<PageView>> {
        DuckDbBackend::events_for_day(self, day).await
    }

    async fn earliest_event_day(&self) -> anyhow::Result<Option<NaiveDate>> {
        DuckDbBackend::earliest_event_day(self).await
    }

    async fn summary_keys_for_day(
        &self,
        scope: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<GroupKey>> {
        DuckDbBackend::summary_keys_for_day(self, scope, day).await
    }

    async fn replace_day(
        &self,
        scope: &str,
        day: NaiveDate,
        rows: &[DailySummary],
    ) -> anyhow::Result<()> {
        DuckDbBackend::replace_day(self, scope, day, rows).await
    }

    async fn load_summaries(
        &self,
        scope: &str,
        range: DayRange,
    ) -> anyhow::Result<Vec<DailySummary>> {
        DuckDbBackend::load_summaries(self, scope, range).await
    }

    async fn aggregated_days(
        &self,
        scope: &str,
        range: DayRange,
    ) -> anyhow::Result<BTreeSet<NaiveDate>> {
        DuckDbBackend::aggregated_days(self, scope, range).await
    }

    async fn scan_grouped(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> anyhow::Result<Vec<RangeResult>> {
        DuckDbBackend::scan_grouped(self, dimension, filter).await
    }

    async fn scan_day_bounds(
        &self,
        filter: &QueryFilter,
    ) -> anyhow::Result<Option<(NaiveDate, NaiveDate)>> {
        DuckDbBackend::scan_day_bounds(self, filter).await
    }

    async fn scan_buckets(
        &self,
        filter: &QueryFilter,
        granularity: Granularity,
    ) -> anyhow::Result<Vec<BucketTotals>> {
        DuckDbBackend::scan_buckets(self, filter, granularity).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        DuckDbBackend::ping(self).await
    }
}

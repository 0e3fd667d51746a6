//! Range queries answered from daily summaries.
//!
//! A query picks the first scope whose dimensions cover the grouping and
//! filter columns, loads that scope's rows for the range and unions the
//! per-day distinct items per group. When no scope fits, or nothing in the
//! range was ever aggregated, the store's event scan answers instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::analytics::{
    AnalyticsStore, BucketTotals, Granularity, PerformancePoint, QueryFilter, RangeResult,
    TOP_LIMIT,
};
use crate::error::{CoreError, CoreResult};
use crate::sketch::DistinctItems;
use crate::summary::{DailySummary, Dimension, ScopeConfig};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Candidate scopes, in preference order.
    pub scopes: Vec<ScopeConfig>,
    /// `None` disables the result cache.
    pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuerySource {
    Summaries { scope: String },
    EventScan,
}

/// Days of the range the summaries cannot vouch for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Completeness {
    /// Never aggregated; counted as zero.
    pub missing_days: Vec<NaiveDate>,
    /// Aggregated, but no row matches the filter.
    pub empty_days: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse<T> {
    pub results: Vec<T>,
    pub source: QuerySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completeness: Option<Completeness>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueryKind {
    Grouped,
    Top,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: QueryKind,
    dimension: Option<Dimension>,
    filter: QueryFilter,
}

#[derive(Debug, Clone)]
enum CachedResponse {
    Ranges(QueryResponse<RangeResult>),
    Performance(QueryResponse<PerformancePoint>),
}

pub struct QueryService {
    store: Arc<dyn AnalyticsStore>,
    scopes: Vec<ScopeConfig>,
    cache: Option<Cache<CacheKey, CachedResponse>>,
}

impl QueryService {
    pub fn new(store: Arc<dyn AnalyticsStore>, options: QueryOptions) -> Self {
        let cache = options.cache_ttl.map(|ttl| {
            Cache::builder()
                .max_capacity(1_000)
                .time_to_live(ttl)
                .build()
        });
        Self {
            store,
            scopes: options.scopes,
            cache,
        }
    }

    /// Drop every cached result. Call after a successful aggregation run.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Per-group totals sorted by ascending label.
    pub async fn grouped(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> CoreResult<QueryResponse<RangeResult>> {
        if !matches!(dimension, Dimension::Country | Dimension::Author) {
            return Err(CoreError::InvalidQuery(format!(
                "cannot group by {}",
                dimension.as_str()
            )));
        }
        let key = CacheKey {
            kind: QueryKind::Grouped,
            dimension: Some(dimension),
            filter: filter.clone(),
        };
        if let Some(CachedResponse::Ranges(hit)) = self.cached(&key).await {
            return Ok(hit);
        }

        let mut response = self.range_results(dimension, filter).await?;
        response.results.sort_by(|a, b| a.x.cmp(&b.x));

        self.store_cached(key, CachedResponse::Ranges(response.clone()))
            .await;
        Ok(response)
    }

    /// The ten groups with the most views; ties broken by label.
    pub async fn top(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> CoreResult<QueryResponse<RangeResult>> {
        let key = CacheKey {
            kind: QueryKind::Top,
            dimension: Some(dimension),
            filter: filter.clone(),
        };
        if let Some(CachedResponse::Ranges(hit)) = self.cached(&key).await {
            return Ok(hit);
        }

        let mut response = self.range_results(dimension, filter).await?;
        rank_top(&mut response.results);

        self.store_cached(key, CachedResponse::Ranges(response.clone()))
            .await;
        Ok(response)
    }

    /// View totals per day, week, month or year with growth over the
    /// previous bucket.
    pub async fn performance(
        &self,
        filter: &QueryFilter,
    ) -> CoreResult<QueryResponse<PerformancePoint>> {
        let key = CacheKey {
            kind: QueryKind::Performance,
            dimension: None,
            filter: filter.clone(),
        };
        if let Some(CachedResponse::Performance(hit)) = self.cached(&key).await {
            return Ok(hit);
        }

        let (buckets, source, completeness) = match self.summary_rows(None, filter).await? {
            Some(rows) => {
                let started = Instant::now();
                let buckets = union_buckets(&rows.rows, filter.compare)?;
                record_union_latency(started);
                (buckets, rows.source, rows.completeness)
            }
            None => {
                let buckets = match self
                    .store
                    .scan_day_bounds(filter)
                    .await
                    .map_err(CoreError::Query)?
                {
                    Some((first, last)) => {
                        let granularity =
                            filter.compare.unwrap_or_else(|| Granularity::auto(first, last));
                        self.store
                            .scan_buckets(filter, granularity)
                            .await
                            .map_err(CoreError::Query)?
                    }
                    None => Vec::new(),
                };
                (buckets, QuerySource::EventScan, scan_completeness(filter))
            }
        };

        let response = QueryResponse {
            results: performance_points(&buckets),
            source,
            completeness,
        };
        self.store_cached(key, CachedResponse::Performance(response.clone()))
            .await;
        Ok(response)
    }

    async fn range_results(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> CoreResult<QueryResponse<RangeResult>> {
        match self.summary_rows(Some(dimension), filter).await? {
            Some(rows) => {
                let started = Instant::now();
                let results = union_groups(&rows.rows, dimension)?;
                record_union_latency(started);
                Ok(QueryResponse {
                    results,
                    source: rows.source,
                    completeness: rows.completeness,
                })
            }
            None => {
                let results = self
                    .store
                    .scan_grouped(dimension, filter)
                    .await
                    .map_err(CoreError::Query)?;
                Ok(QueryResponse {
                    results,
                    source: QuerySource::EventScan,
                    completeness: scan_completeness(filter),
                })
            }
        }
    }

    /// First scope carrying the grouping dimension and every filtered one.
    fn select_scope(&self, dimension: Option<Dimension>, filter: &QueryFilter) -> Option<&ScopeConfig> {
        let needed: Vec<Dimension> = dimension.into_iter().chain(filter.dimensions()).collect();
        self.scopes
            .iter()
            .find(|scope| needed.iter().all(|d| scope.covers(*d)))
    }

    /// Filtered summary rows for the range, or `None` when the event scan
    /// has to answer.
    async fn summary_rows(
        &self,
        dimension: Option<Dimension>,
        filter: &QueryFilter,
    ) -> CoreResult<Option<SummaryRows>> {
        let Some(scope) = self.select_scope(dimension, filter) else {
            debug!(
                dimension = dimension.map(|d| d.as_str()),
                "No scope covers the query; scanning page views"
            );
            metrics::counter!("viewstats.query.fallback_scans", "reason" => "no_scope")
                .increment(1);
            return Ok(None);
        };

        let aggregated = self
            .store
            .aggregated_days(&scope.name, filter.range)
            .await
            .map_err(CoreError::Query)?;
        if aggregated.is_empty() {
            debug!(scope = %scope.name, "Range never aggregated; scanning page views");
            metrics::counter!("viewstats.query.fallback_scans", "reason" => "not_aggregated")
                .increment(1);
            return Ok(None);
        }

        let rows: Vec<DailySummary> = self
            .store
            .load_summaries(&scope.name, filter.range)
            .await
            .map_err(CoreError::Query)?
            .into_iter()
            .filter(|row| filter.matches(&row.key))
            .collect();

        let missing_days: Vec<NaiveDate> = filter
            .range
            .days()
            .filter(|day| !aggregated.contains(day))
            .collect();
        if !missing_days.is_empty() {
            warn!(
                scope = %scope.name,
                missing = missing_days.len(),
                first_missing = %missing_days[0],
                "Summary days missing from query range; counted as zero"
            );
        }

        let completeness = filter.strict.then(|| {
            let with_rows: BTreeSet<NaiveDate> = rows.iter().map(|r| r.day).collect();
            Completeness {
                empty_days: aggregated
                    .iter()
                    .filter(|day| !with_rows.contains(day))
                    .copied()
                    .collect(),
                missing_days,
            }
        });

        Ok(Some(SummaryRows {
            rows,
            source: QuerySource::Summaries {
                scope: scope.name.clone(),
            },
            completeness,
        }))
    }

    async fn cached(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.cache.as_ref()?.get(key).await
    }

    async fn store_cached(&self, key: CacheKey, value: CachedResponse) {
        if let Some(cache) = &self.cache {
            cache.insert(key, value).await;
        }
    }
}

struct SummaryRows {
    rows: Vec<DailySummary>,
    source: QuerySource,
    completeness: Option<Completeness>,
}

/// Event scans read every day directly, so nothing is missing.
fn scan_completeness(filter: &QueryFilter) -> Option<Completeness> {
    filter.strict.then(Completeness::default)
}

fn record_union_latency(started: Instant) {
    metrics::histogram!("viewstats.query.union_latency_ms")
        .record(started.elapsed().as_secs_f64() * 1000.0);
}

/// Sum views and union distinct items per label. Rows with an empty label
/// (unknown country) are dropped.
fn union_groups(rows: &[DailySummary], dimension: Dimension) -> CoreResult<Vec<RangeResult>> {
    let mut groups: BTreeMap<&str, (u64, Vec<&DistinctItems>)> = BTreeMap::new();
    for row in rows {
        let label = row.key.get(dimension);
        if label.is_empty() {
            continue;
        }
        let entry = groups.entry(label).or_default();
        entry.0 += row.total_views;
        entry.1.push(&row.items);
    }

    groups
        .into_iter()
        .map(|(label, (views, parts))| {
            let distinct = DistinctItems::union_all(parts)?;
            Ok(RangeResult {
                x: label.to_string(),
                y: distinct.map_or(0, |d| d.cardinality()),
                z: views,
            })
        })
        .collect()
}

/// Bucket the rows by day, week, month or year.
fn union_buckets(
    rows: &[DailySummary],
    compare: Option<Granularity>,
) -> CoreResult<Vec<BucketTotals>> {
    let with_views = rows.iter().filter(|r| r.total_views > 0);
    let first = with_views.clone().map(|r| r.day).min();
    let last = with_views.map(|r| r.day).max();
    let (Some(first), Some(last)) = (first, last) else {
        return Ok(Vec::new());
    };
    let granularity = compare.unwrap_or_else(|| Granularity::auto(first, last));

    let mut buckets: BTreeMap<NaiveDate, (u64, Vec<&DistinctItems>)> = BTreeMap::new();
    for row in rows {
        let entry = buckets.entry(granularity.bucket_start(row.day)).or_default();
        entry.0 += row.total_views;
        entry.1.push(&row.items);
    }

    buckets
        .into_iter()
        .map(|(bucket, (views, parts))| {
            let distinct = DistinctItems::union_all(parts)?;
            Ok(BucketTotals {
                bucket,
                views,
                items: distinct.map_or(0, |d| d.cardinality()),
            })
        })
        .collect()
}

fn rank_top(results: &mut Vec<RangeResult>) {
    results.sort_by(|a, b| b.z.cmp(&a.z).then_with(|| a.x.cmp(&b.x)));
    results.truncate(TOP_LIMIT);
}

/// Label buckets and compute growth against the previous non-empty bucket.
pub fn performance_points(buckets: &[BucketTotals]) -> Vec<PerformancePoint> {
    let mut previous = 0u64;
    buckets
        .iter()
        .filter(|b| b.views > 0)
        .map(|b| {
            let growth = if previous == 0 {
                0.0
            } else {
                let pct = (b.views as f64 - previous as f64) / previous as f64 * 100.0;
                (pct * 100.0).round() / 100.0
            };
            previous = b.views;
            PerformancePoint {
                x: format!("{} ({} items)", b.bucket.format("%Y-%m-%d"), b.items),
                y: b.views,
                z: growth,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::{DayRange, GroupKey};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn row(day: &str, country: &str, views: u64, ids: &[&str]) -> DailySummary {
        let items: BTreeSet<String> = ids.iter().map(|s| s.to_string()).collect();
        DailySummary {
            scope: "daily".into(),
            day: d(day),
            key: GroupKey {
                country_code: country.into(),
                ..Default::default()
            },
            total_views: views,
            unique_items: items.len() as u64,
            items: DistinctItems::Exact(items),
        }
    }

    #[test]
    fn test_union_groups_counts_repeated_items_once() {
        let rows = vec![
            row("2024-01-01", "US", 2, &["1", "2"]),
            row("2024-01-02", "US", 1, &["1"]),
            row("2024-01-01", "UK", 1, &["3"]),
        ];
        let results = union_groups(&rows, Dimension::Country).expect("union");
        assert_eq!(
            results,
            vec![
                RangeResult { x: "UK".into(), y: 1, z: 1 },
                RangeResult { x: "US".into(), y: 2, z: 3 },
            ]
        );
    }

    #[test]
    fn test_union_groups_drops_unknown_country() {
        let rows = vec![row("2024-01-01", "", 5, &["1"])];
        assert!(union_groups(&rows, Dimension::Country)
            .expect("union")
            .is_empty());
    }

    #[test]
    fn test_rank_top_orders_by_views_then_label() {
        let mut results: Vec<RangeResult> = (0..12)
            .map(|i| RangeResult {
                x: format!("c{i:02}"),
                y: 1,
                z: if i % 2 == 0 { 5 } else { 7 },
            })
            .collect();
        rank_top(&mut results);
        assert_eq!(results.len(), TOP_LIMIT);
        assert_eq!(results[0].x, "c01");
        assert_eq!(results[5].x, "c11");
        assert_eq!(results[6].x, "c00");
        assert_eq!(results[9].x, "c06");
        assert!(results.windows(2).all(|w| w[0].z >= w[1].z));
    }

    #[test]
    fn test_performance_points_growth() {
        let buckets = vec![
            BucketTotals { bucket: d("2024-01-01"), views: 4, items: 2 },
            BucketTotals { bucket: d("2024-01-02"), views: 0, items: 0 },
            BucketTotals { bucket: d("2024-01-03"), views: 6, items: 3 },
            BucketTotals { bucket: d("2024-01-04"), views: 3, items: 1 },
        ];
        let points = performance_points(&buckets);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].x, "2024-01-01 (2 items)");
        assert_eq!(points[0].z, 0.0);
        assert_eq!(points[1].z, 50.0);
        assert_eq!(points[2].z, -50.0);
    }

    #[test]
    fn test_union_buckets_weekly_unions_items() {
        let rows = vec![
            row("2024-01-01", "US", 1, &["1"]),
            row("2024-01-03", "UK", 1, &["1", "2"]),
            row("2024-01-09", "US", 2, &["3"]),
        ];
        let buckets = union_buckets(&rows, Some(Granularity::Week)).expect("buckets");
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket, d("2024-01-01"));
        assert_eq!(buckets[0].views, 2);
        assert_eq!(buckets[0].items, 2);
        assert_eq!(buckets[1].bucket, d("2024-01-08"));
    }

    #[test]
    fn test_union_buckets_rejects_mixed_representations() {
        let mut sketch_row = row("2024-01-02", "US", 1, &[]);
        sketch_row.items =
            DistinctItems::Sketch(crate::sketch::HllSketch::from_items(["9"]));
        let rows = vec![row("2024-01-01", "US", 1, &["1"]), sketch_row];
        assert!(matches!(
            union_buckets(&rows, Some(Granularity::Month)),
            Err(CoreError::InconsistentSketchState)
        ));
    }

    #[test]
    fn test_scan_completeness_only_when_strict() {
        let mut filter = QueryFilter::for_range(DayRange::single(d("2024-01-01")));
        assert!(scan_completeness(&filter).is_none());
        filter.strict = true;
        assert_eq!(scan_completeness(&filter), Some(Completeness::default()));
    }
}

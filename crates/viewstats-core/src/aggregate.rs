//! Daily summary build.
//!
//! Each day is one unit of work: load that day's page views, group them by
//! the scope's key, and replace the day's summary rows in one transaction.
//! Days run sequentially so at most one day of page views is in memory, and
//! a failed day never stops its siblings.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analytics::AnalyticsStore;
use crate::error::{CoreError, CoreResult};
use crate::event::PageView;
use crate::lock::{Lease, RecomputeLock};
use crate::query::QueryService;
use crate::sketch::{DistinctItems, HllSketch};
use crate::summary::{DailySummary, DayRange, DistinctMode, GroupKey, ScopeConfig};

/// Which days a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    Day(NaiveDate),
    Range(DayRange),
    /// `today - n ..= today`.
    LastDays(u32),
    /// Earliest page view ..= today.
    All,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Compute and report, write nothing.
    pub dry_run: bool,
    /// Skip the recompute lock.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayFailure {
    pub day: NaiveDate,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some days failed or the run was cancelled; retry the missing days.
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    pub scope: String,
    pub range: Option<DayRange>,
    pub succeeded: Vec<NaiveDate>,
    pub failed: Vec<DayFailure>,
    pub rows_written: u64,
    pub rows_created: u64,
    pub rows_replaced: u64,
    pub total_views: u64,
    pub dry_run: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    /// Set when the recompute lease was lost before the range was done.
    #[serde(skip)]
    lease_lost: bool,
}

impl AggregationResult {
    fn empty(scope: &ScopeConfig, range: Option<DayRange>, dry_run: bool) -> Self {
        Self {
            scope: scope.name.clone(),
            range,
            succeeded: Vec::new(),
            failed: Vec::new(),
            rows_written: 0,
            rows_created: 0,
            rows_replaced: 0,
            total_views: 0,
            dry_run,
            cancelled: false,
            elapsed_ms: 0,
            lease_lost: false,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.failed.is_empty() && !self.cancelled {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }

    pub fn failed_days(&self) -> Vec<NaiveDate> {
        self.failed.iter().map(|f| f.day).collect()
    }
}

struct DayOutcome {
    rows: u64,
    created: u64,
    replaced: u64,
    views: u64,
}

/// Group one day's page views into summary rows for `scope`.
///
/// Groups without views produce no row. Rows come out ordered by key so
/// re-running a day yields identical output.
pub fn summarize_day(scope: &ScopeConfig, day: NaiveDate, views: &[PageView]) -> Vec<DailySummary> {
    let mut groups: BTreeMap<GroupKey, (u64, BTreeSet<String>)> = BTreeMap::new();
    for view in views {
        let entry = groups.entry(GroupKey::for_view(view, scope)).or_default();
        entry.0 += 1;
        entry.1.insert(view.content_id.clone());
    }

    groups
        .into_iter()
        .map(|(key, (total_views, ids))| {
            let items = match scope.distinct_mode {
                DistinctMode::Exact => DistinctItems::Exact(ids),
                DistinctMode::Approximate => {
                    DistinctItems::Sketch(HllSketch::from_items(ids.iter().map(String::as_str)))
                }
            };
            DailySummary {
                scope: scope.name.clone(),
                day,
                key,
                total_views,
                unique_items: items.cardinality(),
                items,
            }
        })
        .collect()
}

pub struct AggregationEngine {
    store: Arc<dyn AnalyticsStore>,
    lock: RecomputeLock,
    queries: Option<Arc<QueryService>>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn AnalyticsStore>, lock: RecomputeLock) -> Self {
        Self {
            store,
            lock,
            queries: None,
        }
    }

    /// Clear `queries`' result cache after every run that wrote rows.
    pub fn with_query_cache(mut self, queries: Arc<QueryService>) -> Self {
        self.queries = Some(queries);
        self
    }

    /// Resolve a target into a concrete range. `None` when there is nothing
    /// to aggregate (no page views at all for [`RunTarget::All`]).
    pub async fn resolve_target(
        &self,
        target: RunTarget,
        today: NaiveDate,
    ) -> CoreResult<Option<DayRange>> {
        match target {
            RunTarget::Day(day) => Ok(Some(DayRange::single(day))),
            RunTarget::Range(range) => Ok(Some(range)),
            RunTarget::LastDays(n) => Ok(DayRange::new(today - Duration::days(n as i64), today)),
            RunTarget::All => {
                let earliest = self
                    .store
                    .earliest_event_day()
                    .await
                    .map_err(CoreError::StoreUnavailable)?;
                Ok(earliest.and_then(|start| DayRange::new(start, today.max(start))))
            }
        }
    }

    /// Full run for one scope: check the store, take the scope's recompute
    /// lock (unless forced), then aggregate every day of the target.
    ///
    /// Fails as a whole only with [`CoreError::StoreUnavailable`] or
    /// [`CoreError::LockUnavailable`]; day-level failures are reported in the
    /// result.
    pub async fn run(
        &self,
        scope: &ScopeConfig,
        target: RunTarget,
        today: NaiveDate,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<AggregationResult> {
        self.store.ping().await.map_err(CoreError::StoreUnavailable)?;

        let body = move |lease: Option<Lease>| async move {
            let Some(range) = self.resolve_target(target, today).await? else {
                info!(scope = %scope.name, "No page views found; nothing to aggregate");
                return Ok(AggregationResult::empty(scope, None, options.dry_run));
            };
            let result = self
                .aggregate_days(scope, range, options.dry_run, cancel, lease.as_ref())
                .await;
            if result.lease_lost {
                return Err(CoreError::LockUnavailable {
                    scope: scope.lock_key(),
                });
            }
            Ok(result)
        };

        let result = if options.force {
            warn!(scope = %scope.name, "Forced run: recompute lock not taken");
            body(None).await?
        } else {
            self.lock
                .with_lock(&scope.lock_key(), |lease| body(Some(lease)))
                .await?
        };

        if result.rows_written > 0 {
            if let Some(queries) = &self.queries {
                queries.invalidate_cache();
            }
        }
        Ok(result)
    }

    /// Aggregate `range` day by day without taking the lock.
    pub async fn aggregate(
        &self,
        scope: &ScopeConfig,
        range: DayRange,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> AggregationResult {
        self.aggregate_days(scope, range, dry_run, cancel, None).await
    }

    /// Day loop. With a `lease`, each day starts only while the lease is
    /// still held; a lost lease aborts the remaining days.
    async fn aggregate_days(
        &self,
        scope: &ScopeConfig,
        range: DayRange,
        dry_run: bool,
        cancel: &CancellationToken,
        lease: Option<&Lease>,
    ) -> AggregationResult {
        let started = Instant::now();
        let mut result = AggregationResult::empty(scope, Some(range), dry_run);
        info!(
            scope = %scope.name,
            start = %range.start,
            end = %range.end,
            days = range.len_days(),
            dry_run,
            "Starting pre-calculation"
        );

        for day in range.days() {
            if cancel.is_cancelled() {
                warn!(scope = %scope.name, next_day = %day, "Pre-calculation cancelled");
                result.cancelled = true;
                break;
            }
            if lease.is_some_and(Lease::is_lost) {
                error!(
                    scope = %scope.name,
                    next_day = %day,
                    completed = result.succeeded.len(),
                    "Recompute lease lost; aborting remaining days"
                );
                break;
            }

            match self.aggregate_day(scope, day, dry_run).await {
                Ok(outcome) => {
                    result.succeeded.push(day);
                    result.rows_created += outcome.created;
                    result.rows_replaced += outcome.replaced;
                    result.total_views += outcome.views;
                    if !dry_run {
                        result.rows_written += outcome.rows;
                    }
                    metrics::counter!("viewstats.precalc.days_processed", "scope" => scope.name.clone())
                        .increment(1);
                    metrics::counter!("viewstats.precalc.rows_written", "scope" => scope.name.clone())
                        .increment(if dry_run { 0 } else { outcome.rows });
                }
                Err(e) => {
                    let failure = DayFailure {
                        day,
                        error: format!("{e:#}"),
                    };
                    error!(scope = %scope.name, day = %failure.day, error = %failure.error, "Day aggregation failed");
                    result.failed.push(failure);
                    metrics::counter!("viewstats.precalc.days_failed", "scope" => scope.name.clone())
                        .increment(1);
                }
            }
        }

        // A lease lost during the last day still means the writes overlapped.
        if lease.is_some_and(Lease::is_lost) {
            result.lease_lost = true;
        }

        let elapsed = started.elapsed();
        result.elapsed_ms = elapsed.as_millis() as u64;
        metrics::histogram!("viewstats.precalc.duration_ms", "scope" => scope.name.clone())
            .record(elapsed.as_secs_f64() * 1000.0);

        info!(
            scope = %scope.name,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            created = result.rows_created,
            replaced = result.rows_replaced,
            dry_run,
            elapsed_ms = result.elapsed_ms,
            "Pre-calculation finished"
        );
        result
    }

    async fn aggregate_day(
        &self,
        scope: &ScopeConfig,
        day: NaiveDate,
        dry_run: bool,
    ) -> anyhow::Result<DayOutcome> {
        let views = self.store.events_for_day(day).await?;
        let rows = summarize_day(scope, day, &views);

        let existing: HashSet<GroupKey> = self
            .store
            .summary_keys_for_day(&scope.name, day)
            .await?
            .into_iter()
            .collect();
        let replaced = rows.iter().filter(|r| existing.contains(&r.key)).count() as u64;

        if !dry_run {
            self.store.replace_day(&scope.name, day, &rows).await?;
        }

        Ok(DayOutcome {
            rows: rows.len() as u64,
            created: rows.len() as u64 - replaced,
            replaced,
            views: views.len() as u64,
        })
    }
}

//! Query types and the storage abstraction behind the engine and query service.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::event::PageView;
use crate::summary::{DailySummary, DayRange, Dimension, GroupKey};

pub const YEAR_MIN: i32 = 2000;
pub const YEAR_MAX: i32 = 2100;
pub const COUNTRY_CODE_MAX_LENGTH: usize = 5;
pub const TOP_LIMIT: usize = 10;

/// `{x, y, z}` row returned by grouped and top queries.
///
/// `x` is the group label, `y` the distinct content items over the whole
/// range, `z` the total views over the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeResult {
    pub x: String,
    pub y: u64,
    pub z: u64,
}

/// `{x, y, z}` row of the performance time series: `x` is
/// `"YYYY-MM-DD (N items)"`, `y` the views in the bucket, `z` the growth in
/// percent over the previous bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
    pub x: String,
    pub y: u64,
    pub z: f64,
}

/// Per-bucket totals produced by the fallback event scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTotals {
    pub bucket: NaiveDate,
    pub views: u64,
    pub items: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// >365 days → month, >30 days → week, otherwise day.
    pub fn auto(first: NaiveDate, last: NaiveDate) -> Self {
        let days = (last - first).num_days().max(1);
        if days > 365 {
            Self::Month
        } else if days > 30 {
            Self::Week
        } else {
            Self::Day
        }
    }

    /// First day of the bucket containing `day`. Weeks start on Monday.
    pub fn bucket_start(&self, day: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => day,
            Self::Week => day - Duration::days(day.weekday().num_days_from_monday() as i64),
            Self::Month => day.with_day(1).unwrap_or(day),
            Self::Year => NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day),
        }
    }
}

/// Query parameters as accepted from callers, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Shortcut: `day`, `week`, `month` or `year` back from today.
    pub range: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub year: Option<i32>,
    /// Include only these countries (OR).
    pub country_codes: Option<Vec<String>>,
    /// Exclude all of these countries.
    pub exclude_country_codes: Option<Vec<String>>,
    pub author: Option<String>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    /// Force the performance bucket size.
    pub compare: Option<String>,
    /// Report missing and empty days alongside the result.
    #[serde(default)]
    pub strict: bool,
}

impl QueryRequest {
    /// Validate and resolve into a concrete [`QueryFilter`].
    ///
    /// `range` overrides `year`, which overrides `start_date`/`end_date`.
    /// Without any date input the range is all time up to `today`.
    pub fn resolve(&self, today: NaiveDate) -> CoreResult<QueryFilter> {
        let range = if let Some(shortcut) = self.range.as_deref() {
            let days = match shortcut {
                "day" => 1,
                "week" => 7,
                "month" => 30,
                "year" => 365,
                other => {
                    return Err(CoreError::InvalidQuery(format!(
                        "range must be one of: day, week, month, year (got '{other}')"
                    )))
                }
            };
            DayRange::new(today - Duration::days(days), today)
        } else if let Some(year) = self.year {
            if !(YEAR_MIN..=YEAR_MAX).contains(&year) {
                return Err(CoreError::InvalidQuery(format!(
                    "year must be between {YEAR_MIN} and {YEAR_MAX}"
                )));
            }
            NaiveDate::from_ymd_opt(year, 1, 1)
                .zip(NaiveDate::from_ymd_opt(year, 12, 31))
                .and_then(|(start, end)| DayRange::new(start, end))
        } else {
            let start = self
                .start_date
                .or_else(|| NaiveDate::from_ymd_opt(YEAR_MIN, 1, 1))
                .unwrap_or(today);
            DayRange::new(start, self.end_date.unwrap_or(today))
        };
        let range = range.ok_or_else(|| {
            CoreError::InvalidQuery("end_date must be on or after start_date".into())
        })?;

        let country_codes = validate_codes("country_codes", self.country_codes.as_deref())?;
        let exclude_country_codes =
            validate_codes("exclude_country_codes", self.exclude_country_codes.as_deref())?;

        let compare = match self.compare.as_deref() {
            None => None,
            Some(raw) => Some(Granularity::parse(raw).ok_or_else(|| {
                CoreError::InvalidQuery("compare must be one of: day, week, month, year".into())
            })?),
        };

        Ok(QueryFilter {
            range,
            country_codes,
            exclude_country_codes,
            author: self.author.clone(),
            content_type: self.content_type.clone(),
            content_id: self.content_id.clone(),
            compare,
            strict: self.strict,
        })
    }
}

fn validate_codes(field: &str, codes: Option<&[String]>) -> CoreResult<Vec<String>> {
    let Some(codes) = codes else {
        return Ok(Vec::new());
    };
    if codes.is_empty() {
        return Err(CoreError::InvalidQuery(format!(
            "{field}: Cannot be an empty list. Omit the field or provide at least one country code."
        )));
    }
    if let Some(bad) = codes.iter().find(|c| c.len() > COUNTRY_CODE_MAX_LENGTH) {
        return Err(CoreError::InvalidQuery(format!(
            "{field}: '{bad}' exceeds {COUNTRY_CODE_MAX_LENGTH} characters"
        )));
    }
    Ok(codes.to_vec())
}

/// Validated filter applied uniformly to summary reads and event scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryFilter {
    pub range: DayRange,
    pub country_codes: Vec<String>,
    pub exclude_country_codes: Vec<String>,
    pub author: Option<String>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub compare: Option<Granularity>,
    pub strict: bool,
}

impl QueryFilter {
    pub fn for_range(range: DayRange) -> Self {
        Self {
            range,
            country_codes: Vec::new(),
            exclude_country_codes: Vec::new(),
            author: None,
            content_type: None,
            content_id: None,
            compare: None,
            strict: false,
        }
    }

    /// Dimensions a summary scope must carry to evaluate this filter.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut dims = Vec::new();
        if !self.country_codes.is_empty() || !self.exclude_country_codes.is_empty() {
            dims.push(Dimension::Country);
        }
        if self.author.is_some() {
            dims.push(Dimension::Author);
        }
        if self.content_type.is_some() {
            dims.push(Dimension::ContentType);
        }
        if self.content_id.is_some() {
            dims.push(Dimension::Content);
        }
        dims
    }

    /// Whether a summary row's key passes the filter. Only meaningful for
    /// keys of a scope covering [`Self::dimensions`].
    pub fn matches(&self, key: &GroupKey) -> bool {
        if !self.country_codes.is_empty() && !self.country_codes.contains(&key.country_code) {
            return false;
        }
        if self.exclude_country_codes.contains(&key.country_code) {
            return false;
        }
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&self.author, &key.author)
            && eq(&self.content_type, &key.content_type)
            && eq(&self.content_id, &key.content_id)
    }
}

/// Storage interface for page views, daily summaries and the run ledger.
///
/// The DuckDB backend implements it; tests wrap it to inject failures and
/// delays. Methods return `anyhow::Result`; the engine and query service
/// decide which failures are per-day, fatal, or query errors.
#[async_trait]
pub trait AnalyticsStore: Send + Sync + 'static {
    async fn insert_events(&self, views: &[PageView]) -> Result<()>;

    /// All page views whose `viewed_at` falls on `day` (UTC).
    async fn events_for_day(&self, day: NaiveDate) -> Result<Vec<PageView>>;

    async fn earliest_event_day(&self) -> Result<Option<NaiveDate>>;

    /// Keys of the rows currently stored for `(scope, day)`.
    async fn summary_keys_for_day(&self, scope: &str, day: NaiveDate) -> Result<Vec<GroupKey>>;

    /// Atomically replace every summary row of `(scope, day)` with `rows`
    /// and record the day in the run ledger.
    async fn replace_day(&self, scope: &str, day: NaiveDate, rows: &[DailySummary])
        -> Result<()>;

    async fn load_summaries(&self, scope: &str, range: DayRange) -> Result<Vec<DailySummary>>;

    /// Days of `range` that have a committed aggregation for `scope`.
    async fn aggregated_days(&self, scope: &str, range: DayRange) -> Result<BTreeSet<NaiveDate>>;

    /// Grouped `{x, y, z}` straight from page views. Order unspecified.
    async fn scan_grouped(
        &self,
        dimension: Dimension,
        filter: &QueryFilter,
    ) -> Result<Vec<RangeResult>>;

    /// First and last day with matching page views.
    async fn scan_day_bounds(&self, filter: &QueryFilter) -> Result<Option<(NaiveDate, NaiveDate)>>;

    /// Views and distinct items per bucket straight from page views, ordered
    /// by bucket.
    async fn scan_buckets(
        &self,
        filter: &QueryFilter,
        granularity: Granularity,
    ) -> Result<Vec<BucketTotals>>;

    async fn ping(&self) -> Result<()>;
}

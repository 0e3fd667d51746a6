//! Daily summary rows and the scope definitions that partition them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::event::PageView;
use crate::sketch::DistinctItems;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Country,
    Author,
    ContentType,
    Content,
}

impl Dimension {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "country" => Some(Self::Country),
            // The public API calls authors "users".
            "author" | "user" => Some(Self::Author),
            "content_type" => Some(Self::ContentType),
            "content" | "blog" => Some(Self::Content),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Author => "author",
            Self::ContentType => "content_type",
            Self::Content => "content",
        }
    }

    /// DuckDB column holding this dimension, identical in `page_views` and
    /// `daily_summaries`.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Country => "country_code",
            Self::Author => "author",
            Self::ContentType => "content_type",
            Self::Content => "content_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistinctMode {
    Exact,
    Approximate,
}

impl DistinctMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "exact" => Some(Self::Exact),
            "approximate" | "hll" => Some(Self::Approximate),
            _ => None,
        }
    }
}

/// One summary partition: the event columns that key its rows and how its
/// distinct items are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConfig {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub distinct_mode: DistinctMode,
}

impl ScopeConfig {
    pub fn new(name: &str, dimensions: &[Dimension], distinct_mode: DistinctMode) -> Self {
        Self {
            name: name.to_string(),
            dimensions: dimensions.to_vec(),
            distinct_mode,
        }
    }

    /// `daily` (country × author × content type) and `content`.
    pub fn defaults(distinct_mode: DistinctMode) -> Vec<Self> {
        vec![
            Self::new(
                "daily",
                &[Dimension::Country, Dimension::Author, Dimension::ContentType],
                distinct_mode,
            ),
            Self::new("content", &[Dimension::Content], distinct_mode),
        ]
    }

    pub fn covers(&self, dimension: Dimension) -> bool {
        self.dimensions.contains(&dimension)
    }

    pub fn lock_key(&self) -> String {
        format!("viewstats:recompute:{}", self.name)
    }
}

/// Grouping key of a summary row. Columns outside the scope are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub country_code: String,
    pub author: String,
    pub content_type: String,
    pub content_id: String,
}

impl GroupKey {
    pub fn for_view(view: &PageView, scope: &ScopeConfig) -> Self {
        let pick = |dim: Dimension, value: &str| {
            if scope.covers(dim) {
                value.to_string()
            } else {
                String::new()
            }
        };
        Self {
            country_code: pick(
                Dimension::Country,
                view.country_code.as_deref().unwrap_or_default(),
            ),
            author: pick(Dimension::Author, &view.author),
            content_type: pick(Dimension::ContentType, &view.content_type),
            content_id: pick(Dimension::Content, &view.content_id),
        }
    }

    pub fn get(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::Country => &self.country_code,
            Dimension::Author => &self.author,
            Dimension::ContentType => &self.content_type,
            Dimension::Content => &self.content_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySummary {
    pub scope: String,
    pub day: NaiveDate,
    pub key: GroupKey,
    pub total_views: u64,
    pub unique_items: u64,
    pub items: DistinctItems,
}

/// Inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

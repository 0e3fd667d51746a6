use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One page view, exactly as stored in the DuckDB `page_views` table.
///
/// Page views are append-only: ingestion writes them, the aggregation engine
/// and the fallback scan read them, nothing updates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageView {
    /// UUID v4.
    pub id: String,
    pub viewed_at: DateTime<Utc>,
    /// ISO country code (`"US"`, `"UK"`); `None` when GeoIP lookup failed.
    pub country_code: Option<String>,
    /// Username of the content author.
    pub author: String,
    /// Identifier of the viewed content item; the distinct-count key.
    pub content_id: String,
    /// Content kind, e.g. `"blog"`.
    pub content_type: String,
}

impl PageView {
    pub fn new(
        viewed_at: DateTime<Utc>,
        country_code: Option<&str>,
        author: &str,
        content_id: &str,
        content_type: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            viewed_at,
            country_code: country_code.map(str::to_string),
            author: author.to_string(),
            content_id: content_id.to_string(),
            content_type: content_type.to_string(),
        }
    }

    /// UTC calendar day the view belongs to.
    pub fn day(&self) -> NaiveDate {
        self.viewed_at.date_naive()
    }
}

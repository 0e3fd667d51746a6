/// DuckDB initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. Every
/// statement uses `IF NOT EXISTS` so it is safe to re-run on each startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `VIEWSTATS_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit: the DuckDB default of 80% of system RAM is too much for a batch job
/// sharing a host with the query side.
///
/// `daily_summaries` carries no unique index: a day is replaced by delete
/// then insert in one transaction. Key uniqueness per `(scope, day)` is the
/// writer's job.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- PAGE VIEWS (append-only facts)
-- ===========================================
CREATE TABLE IF NOT EXISTS page_views (
    id              VARCHAR NOT NULL,              -- UUID v4
    viewed_at       TIMESTAMP NOT NULL,            -- UTC
    country_code    VARCHAR(5),                    -- NULL when unknown
    author          VARCHAR NOT NULL,
    content_id      VARCHAR NOT NULL,
    content_type    VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_page_views_viewed_at ON page_views(viewed_at);

-- ===========================================
-- DAILY SUMMARIES (one row per scope, day, group key)
-- ===========================================
-- Columns outside the scope hold '' ("all"). Exactly one of item_ids
-- (sorted JSON array) and item_sketch (base64 HLL registers) is set.
CREATE TABLE IF NOT EXISTS daily_summaries (
    scope           VARCHAR NOT NULL,
    day             DATE NOT NULL,
    country_code    VARCHAR NOT NULL DEFAULT '',
    author          VARCHAR NOT NULL DEFAULT '',
    content_type    VARCHAR NOT NULL DEFAULT '',
    content_id      VARCHAR NOT NULL DEFAULT '',
    total_views     BIGINT NOT NULL,
    unique_items    BIGINT NOT NULL,
    item_ids        VARCHAR,
    item_sketch     VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_daily_summaries_scope_day
    ON daily_summaries(scope, day);

-- ===========================================
-- AGGREGATION RUNS (ledger of committed days)
-- ===========================================
-- Written in the same transaction as the day's summaries. A ledger row with
-- no summaries means "aggregated, no page views".
CREATE TABLE IF NOT EXISTS aggregation_runs (
    scope           VARCHAR NOT NULL,
    day             DATE NOT NULL,
    rows_written    BIGINT NOT NULL,
    total_views     BIGINT NOT NULL,
    completed_at    TIMESTAMP NOT NULL,
    PRIMARY KEY (scope, day)
);

-- ===========================================
-- RECOMPUTE LOCKS (advisory leases)
-- ===========================================
CREATE TABLE IF NOT EXISTS recompute_locks (
    scope           VARCHAR PRIMARY KEY,           -- 'viewstats:recompute:' + scope name
    owner           VARCHAR NOT NULL,              -- random 16-byte hex
    expires_at      TIMESTAMP NOT NULL
);
"#
    )
}

pub mod analytics_impl;
pub mod backend;
pub mod lock;
pub mod queries;
pub mod schema;
pub mod summaries;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `viewstats_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;

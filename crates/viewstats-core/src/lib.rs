pub mod aggregate;
pub mod analytics;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod query;
pub mod sketch;
pub mod summary;

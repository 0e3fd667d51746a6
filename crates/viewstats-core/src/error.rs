use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Another run holds the recompute lock for this scope. Safe to retry later.
    #[error("recompute lock for scope '{scope}' is held by another run")]
    LockUnavailable { scope: String },

    /// The transactional store could not be reached. Aborts the invocation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    /// A range union met both exact sets and sketches.
    #[error("inconsistent sketch state: cannot union exact item sets with approximate sketches")]
    InconsistentSketchState,

    #[error("invalid sketch encoding")]
    InvalidSketch,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query failed: {0}")]
    Query(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

use thiserror::Error;

use viewstats_core::error::CoreError;

/// Process exit statuses of the `viewstats` binary.
pub const EXIT_SUCCESS: i32 = 0;
/// Hard failure: lock unavailable, store unreachable, bad arguments.
pub const EXIT_FAILURE: i32 = 1;
/// Some days failed or the run was cancelled.
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    /// Every error is a hard failure; partial runs are reported through
    /// results, not errors.
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }

    /// Stable machine-readable code printed alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            CliError::InvalidArgs(_) => "invalid_args",
            CliError::Config(_) => "config_error",
            CliError::Core(CoreError::LockUnavailable { .. }) => "lock_unavailable",
            CliError::Core(CoreError::StoreUnavailable(_)) => "store_unavailable",
            CliError::Core(CoreError::InvalidQuery(_)) => "invalid_query",
            CliError::Core(CoreError::InconsistentSketchState) => "inconsistent_sketch_state",
            CliError::Core(_) => "query_failed",
            CliError::Internal(_) => "internal_error",
        }
    }
}

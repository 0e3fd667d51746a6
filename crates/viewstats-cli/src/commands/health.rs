use std::io::Write;

use serde_json::json;

use viewstats_core::error::CoreError;

use crate::error::{CliError, EXIT_SUCCESS};
use crate::output::write_json_line;
use crate::state::AppState;

/// Ping the store. Exit 0 when reachable.
pub async fn run<W: Write>(state: &AppState, out: &mut W) -> Result<i32, CliError> {
    state
        .db
        .ping()
        .await
        .map_err(|e| CliError::Core(CoreError::StoreUnavailable(e)))?;
    write_json_line(
        out,
        &json!({
            "status": "ok",
            "lock_backend": state.lock.backend_kind(),
        }),
    )?;
    Ok(EXIT_SUCCESS)
}

//! `viewstats precalc`: rebuild daily summaries, one task per scope.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use viewstats_core::aggregate::{AggregationEngine, RunOptions, RunStatus};

use crate::cli::PrecalcArgs;
use crate::error::{CliError, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::output::write_json_line;
use crate::state::AppState;

pub async fn run<W: Write>(
    state: &AppState,
    args: &PrecalcArgs,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<i32, CliError> {
    let target = args.target()?;
    let scopes = state.scopes(&args.scopes, args.approximate)?;
    let today = Utc::now().date_naive();
    let options = RunOptions {
        dry_run: args.dry_run,
        force: args.force,
    };
    let engine = Arc::new(
        AggregationEngine::new(state.db.clone(), state.lock.clone())
            .with_query_cache(state.query_service()),
    );

    info!(
        scopes = scopes.len(),
        ?target,
        dry_run = options.dry_run,
        force = options.force,
        "Pre-calculation requested"
    );

    let handles: Vec<_> = scopes
        .into_iter()
        .map(|scope| {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = engine.run(&scope, target, today, options, &cancel).await;
                (scope.name, result)
            })
        })
        .collect();

    let mut partial = false;
    let mut hard_failure = None;
    for handle in handles {
        let (scope, result) = handle.await.map_err(|e| CliError::Internal(e.into()))?;
        match result {
            Ok(result) => {
                partial |= result.status() == RunStatus::Partial;
                write_json_line(out, &result)?;
            }
            Err(e) => {
                error!(scope = %scope, error = %e, "Pre-calculation aborted");
                if hard_failure.is_none() {
                    hard_failure = Some(CliError::Core(e));
                }
            }
        }
    }

    match hard_failure {
        Some(e) => Err(e),
        None if partial => Ok(EXIT_PARTIAL),
        None => Ok(EXIT_SUCCESS),
    }
}

pub mod health;
pub mod precalc;
pub mod query;

use std::io::Write;

use tokio_util::sync::CancellationToken;

use viewstats_core::config::Config;
use viewstats_core::error::CoreError;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::state::AppState;

/// Open the store from `config` and dispatch `cli`. Returns the process exit
/// status.
pub async fn run<W: Write>(
    cli: Cli,
    config: Config,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<i32, CliError> {
    let state = AppState::open(config).map_err(|e| CliError::Core(CoreError::StoreUnavailable(e)))?;
    dispatch(&state, cli.command, cancel, out).await
}

pub async fn dispatch<W: Write>(
    state: &AppState,
    command: Command,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<i32, CliError> {
    match command {
        Command::Precalc(args) => precalc::run(state, &args, cancel, out).await,
        Command::Query(args) => query::run(state, &args, out).await,
        Command::Health => health::run(state, out).await,
    }
}

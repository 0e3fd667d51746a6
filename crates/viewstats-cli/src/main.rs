use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use viewstats_cli::cli::Cli;
use viewstats_cli::error::{CliError, EXIT_FAILURE, EXIT_SUCCESS};
use viewstats_core::config::Config;

/// Structured JSON logs on stderr; stdout carries command output only.
/// Level controlled via `RUST_LOG`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "viewstats=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures.
            let code = if e.use_stderr() { EXIT_FAILURE } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after the current day");
                cancel.cancel();
            }
        });
    }

    let result = match Config::from_env() {
        Ok(config) => {
            let mut out = std::io::stdout();
            viewstats_cli::commands::run(cli, config, cancel, &mut out).await
        }
        Err(e) => Err(CliError::Config(e)),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!(code = e.code(), error = %e, "viewstats failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

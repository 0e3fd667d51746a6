use std::io::Write;

use chrono::Utc;

use crate::cli::{QueryArgs, QueryKind};
use crate::error::{CliError, EXIT_SUCCESS};
use crate::output::write_response;
use crate::state::AppState;

pub async fn run<W: Write>(state: &AppState, args: &QueryArgs, out: &mut W) -> Result<i32, CliError> {
    let filter = args.request().resolve(Utc::now().date_naive())?;
    let service = state.query_service();

    match args.kind {
        QueryKind::Grouped => {
            let response = service.grouped(args.dimension()?, &filter).await?;
            write_response(out, &response, args.format)?;
        }
        QueryKind::Top => {
            let response = service.top(args.dimension()?, &filter).await?;
            write_response(out, &response, args.format)?;
        }
        QueryKind::Performance => {
            let response = service.performance(&filter).await?;
            write_response(out, &response, args.format)?;
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use clap::Parser;
    use viewstats_core::config::Config;
    use viewstats_core::event::PageView;
    use viewstats_duckdb::DuckDbBackend;

    use crate::cli::{Cli, Command};

    async fn state() -> AppState {
        let db = DuckDbBackend::open_in_memory().expect("db");
        let today = Utc::now().date_naive();
        let ts = |days_ago: i64| {
            Utc.from_utc_datetime(
                &(today - Duration::days(days_ago))
                    .and_hms_opt(8, 0, 0)
                    .expect("time"),
            )
        };
        db.insert_events(&[
            PageView::new(ts(1), Some("US"), "alice", "1", "blog"),
            PageView::new(ts(1), Some("US"), "alice", "2", "blog"),
            PageView::new(ts(2), Some("UK"), "bob", "3", "blog"),
        ])
        .await
        .expect("insert");
        AppState::new(db, Config::default())
    }

    fn args(argv: &[&str]) -> QueryArgs {
        let cli = Cli::try_parse_from(std::iter::once("viewstats").chain(argv.iter().copied()))
            .expect("parse");
        match cli.command {
            Command::Query(args) => args,
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grouped_csv_from_event_scan() {
        let state = state().await;
        let mut out = Vec::new();
        let code = run(
            &state,
            &args(&["query", "grouped", "--range", "week", "--format", "csv"]),
            &mut out,
        )
        .await
        .expect("query");
        assert_eq!(code, EXIT_SUCCESS);
        assert_eq!(String::from_utf8(out).expect("utf8"), "x,y,z\nUK,1,1\nUS,2,2\n");
    }

    #[tokio::test]
    async fn test_top_authors_json() {
        let state = state().await;
        let mut out = Vec::new();
        run(&state, &args(&["query", "top", "--by", "user"]), &mut out)
            .await
            .expect("query");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["source"]["kind"], "event_scan");
        assert_eq!(value["results"][0]["x"], "alice");
        assert_eq!(value["results"][0]["z"], 2);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let state = state().await;
        let mut out = Vec::new();
        let err = run(
            &state,
            &args(&["query", "grouped", "--range", "fortnight"]),
            &mut out,
        )
        .await
        .expect_err("invalid range");
        assert_eq!(err.code(), "invalid_query");

        let err = run(&state, &args(&["query", "grouped", "--by", "planet"]), &mut out)
            .await
            .expect_err("invalid dimension");
        assert_eq!(err.code(), "invalid_args");
    }

    #[tokio::test]
    async fn test_performance_series() {
        let state = state().await;
        let mut out = Vec::new();
        run(&state, &args(&["query", "performance", "--range", "week"]), &mut out)
            .await
            .expect("query");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        let results = value["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["y"], 2);
        assert_eq!(results[1]["z"], 100.0);
    }
}

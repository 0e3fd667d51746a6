mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use viewstats_core::aggregate::{AggregationEngine, RunOptions, RunStatus, RunTarget};
use viewstats_core::analytics::AnalyticsStore;
use viewstats_core::error::CoreError;
use viewstats_core::lock::{LockBackend, PassThroughLock, RecomputeLock};
use viewstats_core::summary::{DistinctMode, ScopeConfig};
use viewstats_duckdb::DuckDbBackend;

use common::{d, dump_summaries, range, seeded, view, WrappedStore};

fn lock(backend: Arc<dyn LockBackend>) -> RecomputeLock {
    RecomputeLock::new(backend, Duration::from_millis(200), Duration::from_secs(60))
        .with_retry_interval(Duration::from_millis(10))
}

fn daily() -> ScopeConfig {
    ScopeConfig::defaults(DistinctMode::Exact).remove(0)
}

async fn lease_count(db: &DuckDbBackend) -> i64 {
    let conn = db.conn_for_test().await;
    conn.query_row("SELECT COUNT(*) FROM recompute_locks", [], |row| row.get(0))
        .expect("count")
}

fn views() -> Vec<viewstats_core::event::PageView> {
    vec![
        view(1, Some("US"), "alice", "1"),
        view(2, Some("US"), "alice", "2"),
    ]
}

#[tokio::test]
async fn test_concurrent_runs_admit_one_writer() {
    let db = seeded(&views()).await;
    let mut wrapped = WrappedStore::new(db.clone());
    wrapped.load_delay = Duration::from_millis(300);
    let store = Arc::new(wrapped);

    let first = AggregationEngine::new(store.clone(), lock(db.clone()));
    let second = AggregationEngine::new(store.clone(), lock(db.clone()));
    let scope = daily();
    let cancel = CancellationToken::new();
    let target = RunTarget::Range(range(1, 2));

    let (a, b) = tokio::join!(
        first.run(&scope, target, d(2), RunOptions::default(), &cancel),
        second.run(&scope, target, d(2), RunOptions::default(), &cancel),
    );

    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one run to win, got {other:?}"),
    };
    assert_eq!(ok.status(), RunStatus::Success);
    assert!(matches!(err, CoreError::LockUnavailable { .. }));
    // Only the winner wrote: one replace per day.
    assert_eq!(store.replace_calls(), 2);
    assert_eq!(lease_count(&db).await, 0);
}

#[tokio::test]
async fn test_held_lock_blocks_run_without_writes() {
    let db = seeded(&views()).await;
    let scope = daily();
    let _held = db
        .try_acquire_lease(&scope.lock_key(), Duration::from_secs(60))
        .await
        .expect("acquire")
        .expect("lease");

    let engine = AggregationEngine::new(db.clone(), lock(db.clone()));
    let err = engine
        .run(
            &scope,
            RunTarget::Day(d(1)),
            d(1),
            RunOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("lock is held");
    assert!(matches!(err, CoreError::LockUnavailable { ref scope } if scope == "viewstats:recompute:daily"));
    assert!(dump_summaries(&db, "daily").await.is_empty());
}

#[tokio::test]
async fn test_force_bypasses_held_lock() {
    let db = seeded(&views()).await;
    let scope = daily();
    let _held = db
        .try_acquire_lease(&scope.lock_key(), Duration::from_secs(60))
        .await
        .expect("acquire");

    let engine = AggregationEngine::new(db.clone(), lock(db.clone()));
    let result = engine
        .run(
            &scope,
            RunTarget::Day(d(1)),
            d(1),
            RunOptions {
                force: true,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("forced run");
    assert_eq!(result.rows_written, 1);
    // The foreign lease is untouched.
    assert_eq!(lease_count(&db).await, 1);
}

#[tokio::test]
async fn test_lock_released_after_partial_run() {
    let db = seeded(&views()).await;
    let mut wrapped = WrappedStore::new(db.clone());
    wrapped.fail_day = Some(d(1));
    let engine = AggregationEngine::new(Arc::new(wrapped), lock(db.clone()));

    let result = engine
        .run(
            &daily(),
            RunTarget::Range(range(1, 2)),
            d(2),
            RunOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");
    assert_eq!(result.status(), RunStatus::Partial);
    assert_eq!(lease_count(&db).await, 0);
}

#[tokio::test]
async fn test_independent_scopes_run_concurrently() {
    let db = seeded(&views()).await;
    let mut wrapped = WrappedStore::new(db.clone());
    wrapped.load_delay = Duration::from_millis(100);
    let store: Arc<dyn AnalyticsStore> = Arc::new(wrapped);
    let engine = AggregationEngine::new(store, lock(db.clone()));
    let scopes = ScopeConfig::defaults(DistinctMode::Exact);
    let cancel = CancellationToken::new();
    let target = RunTarget::Range(range(1, 2));

    let (a, b) = tokio::join!(
        engine.run(&scopes[0], target, d(2), RunOptions::default(), &cancel),
        engine.run(&scopes[1], target, d(2), RunOptions::default(), &cancel),
    );
    assert_eq!(a.expect("daily").status(), RunStatus::Success);
    assert_eq!(b.expect("content").status(), RunStatus::Success);
}

#[tokio::test]
async fn test_pass_through_lock_runs_overwrite_sequentially() {
    let db = seeded(&views()).await;
    let engine = AggregationEngine::new(db.clone(), lock(Arc::new(PassThroughLock)));
    let scope = daily();
    let cancel = CancellationToken::new();
    let target = RunTarget::Range(range(1, 2));

    let first = engine
        .run(&scope, target, d(2), RunOptions::default(), &cancel)
        .await
        .expect("first");
    let rows_after_first = dump_summaries(&db, "daily").await;
    let second = engine
        .run(&scope, target, d(2), RunOptions::default(), &cancel)
        .await
        .expect("second");

    assert_eq!(first.rows_created, 2);
    assert_eq!(second.rows_replaced, 2);
    assert_eq!(dump_summaries(&db, "daily").await, rows_after_first);
    assert_eq!(lease_count(&db).await, 0);
}

fn short_lease_lock(db: &Arc<DuckDbBackend>) -> RecomputeLock {
    RecomputeLock::new(
        db.clone(),
        Duration::from_millis(50),
        Duration::from_millis(200),
    )
    .with_retry_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_lease_outlives_ttl_during_long_backfill() {
    let db = seeded(&views()).await;
    let mut wrapped = WrappedStore::new(db.clone());
    wrapped.load_delay = Duration::from_millis(300);
    let store = Arc::new(wrapped);

    let first = AggregationEngine::new(store.clone(), short_lease_lock(&db));
    let second = AggregationEngine::new(store.clone(), short_lease_lock(&db));
    let scope = daily();
    let cancel = CancellationToken::new();
    let target = RunTarget::Range(range(1, 3));

    let (a, b) = tokio::join!(
        first.run(&scope, target, d(3), RunOptions::default(), &cancel),
        async {
            // Past the first lease's original expiry.
            tokio::time::sleep(Duration::from_millis(250)).await;
            second
                .run(&scope, target, d(3), RunOptions::default(), &cancel)
                .await
        },
    );

    assert_eq!(a.expect("first run").status(), RunStatus::Success);
    assert!(matches!(b, Err(CoreError::LockUnavailable { .. })));
    assert_eq!(store.replace_calls(), 3);
    assert_eq!(lease_count(&db).await, 0);
}

#[tokio::test]
async fn test_lost_lease_aborts_remaining_days() {
    let db = seeded(&views()).await;
    let mut wrapped = WrappedStore::new(db.clone());
    wrapped.load_delay = Duration::from_millis(300);
    let store = Arc::new(wrapped);

    let engine = AggregationEngine::new(store.clone(), short_lease_lock(&db));
    let scope = daily();
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(
        engine.run(
            &scope,
            RunTarget::Range(range(1, 3)),
            d(3),
            RunOptions::default(),
            &cancel
        ),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let conn = db.conn_for_test().await;
            conn.execute(
                "UPDATE recompute_locks SET owner = 'other-run' WHERE scope = ?1",
                viewstats_duckdb::duckdb::params![scope.lock_key()],
            )
            .expect("steal lease");
        },
    );

    let err = result.expect_err("lease was lost");
    assert!(matches!(err, CoreError::LockUnavailable { ref scope } if scope == "viewstats:recompute:daily"));
    // The day in flight finished; no later day was started.
    assert_eq!(store.replace_calls(), 1);
    // The other owner's lease is left alone.
    assert_eq!(lease_count(&db).await, 1);
}

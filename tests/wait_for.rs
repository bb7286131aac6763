use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tabletxn::{
    Database, DatabaseConfig, EngineEvent, MemoryEngine, NativeHandle, Schema, Table, TxnError,
};

async fn open(heartbeat_ms: u64) -> (Arc<MemoryEngine>, Database) {
    let engine = Arc::new(MemoryEngine::with_tables(["jobs"]));
    let db = Database::open_with_config(
        engine.clone(),
        Schema::new(1).table("jobs"),
        DatabaseConfig::new().wait_for_heartbeat_ms(heartbeat_ms),
    )
    .await
    .unwrap();
    (engine, db)
}

fn count(events: &[EngineEvent], pred: impl Fn(&EngineEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn failing_operation_aborts_and_runs_once() {
    let (engine, db) = open(0).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let c = calls.clone();
    let err = db
        .transaction(move |txn| {
            let calls = c.clone();
            async move {
                Table::new("jobs").put(&txn, json!({"_id": 1})).await?;
                let waited = txn
                    .wait_for(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TxnError::user("remote call failed"))
                    })
                    .await;
                if !txn.is_planning_phase() {
                    assert!(matches!(waited, Err(TxnError::Aborted(_))));
                    assert!(txn.is_aborted());
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err.root_cause(), TxnError::User(_)), "{err:?}");
    assert!(err.to_string().contains("remote call failed"));
    assert!(engine.committed("jobs").is_empty());
}

#[tokio::test]
async fn lease_is_held_while_waiting_and_released_after() {
    let (engine, db) = open(0).await;

    let inspect = engine.clone();
    let value = db
        .transaction(move |txn| {
            let engine = inspect.clone();
            async move {
                Table::new("jobs").count(&txn).await?;
                let planning = txn.is_planning_phase();
                let handle = txn.current_native_handle().ok();
                let leased = txn
                    .wait_for(|| async move {
                        let handle = handle.expect("native handle while executing");
                        Ok(engine.active_leases(handle))
                    })
                    .await?;
                if planning {
                    assert_eq!(leased, 0);
                }
                Ok(leased)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 1);
    let events = engine.events();
    assert_eq!(
        count(&events, |e| matches!(e, EngineEvent::LeaseAcquired(_))),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, EngineEvent::LeaseReleased(_))),
        1
    );
    assert!(events.contains(&EngineEvent::Commit(NativeHandle(1))));
}

#[tokio::test]
async fn heartbeats_keep_a_long_wait_alive() {
    let (engine, db) = open(10).await;

    db.transaction(|txn| async move {
        Table::new("jobs").count(&txn).await?;
        txn.wait_for(|| async {
            tokio::time::sleep(Duration::from_millis(55)).await;
            Ok(())
        })
        .await
    })
    .await
    .unwrap();

    let heartbeats = count(&engine.events(), |e| matches!(e, EngineEvent::Heartbeat(_)));
    assert!((3..=6).contains(&heartbeats), "heartbeats: {heartbeats}");
    assert_eq!(db.stats().heartbeats, heartbeats as u64);
    assert_eq!(db.stats().wait_for.waits, 1);
}

#[tokio::test]
async fn abort_ends_a_pending_wait() {
    let (engine, db) = open(0).await;

    let err = db
        .transaction(|txn| async move {
            Table::new("jobs").count(&txn).await?;
            let aborter = txn.clone();
            let wait = txn.wait_for(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            });
            let abort = async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                aborter.abort(TxnError::aborted("cancelled by caller"));
            };
            let (waited, ()) = tokio::join!(wait, abort);
            if !txn.is_planning_phase() {
                assert!(matches!(waited, Err(TxnError::Aborted(_))));
            }
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled by caller"));
    let events = engine.events();
    assert_eq!(
        count(&events, |e| matches!(e, EngineEvent::LeaseReleased(_))),
        1
    );
    assert_eq!(count(&events, |e| matches!(e, EngineEvent::Rollback(_))), 1);
}

#[tokio::test]
async fn only_one_wait_at_a_time() {
    let (_engine, db) = open(0).await;

    let err = db
        .transaction(|txn| async move {
            Table::new("jobs").count(&txn).await?;
            let first = txn.wait_for(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            });
            let second = txn.wait_for(|| async { Ok(()) });
            let (first, second) = tokio::join!(first, second);
            first?;
            second?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_usage(), "{err}");
    assert!(err.to_string().contains("one wait_for"));
}

//! Two-pass protocol behavior seen from the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use tabletxn::{
    Coordinator, Database, DatabaseConfig, EngineEvent, LockMode, MemoryEngine, NativeHandle,
    Schema, Table, Transaction, TransactionKind, TxnError,
};

fn engine(tables: &[&str]) -> Arc<MemoryEngine> {
    Arc::new(MemoryEngine::with_tables(tables.iter().copied()))
}

fn schema(tables: &[&str]) -> Schema {
    Schema::new(1).tables(tables.iter().copied())
}

#[tokio::test]
async fn two_writes_open_one_read_write_transaction() {
    let engine = engine(&["A", "B"]);
    let db = Database::open(engine.clone(), schema(&["A", "B"]))
        .await
        .unwrap();

    db.transaction(|txn| async move {
        db_write(&txn, "A", 1).await?;
        db_write(&txn, "B", 2).await?;
        Ok(())
    })
    .await
    .unwrap();

    let h = NativeHandle(1);
    assert_eq!(
        engine.events(),
        vec![
            EngineEvent::Open {
                handle: h,
                tables: ["A".to_string(), "B".to_string()].into_iter().collect(),
                mode: LockMode::ReadWrite,
            },
            EngineEvent::Put {
                handle: h,
                table: "A".into(),
                key: json!(1),
            },
            EngineEvent::Put {
                handle: h,
                table: "B".into(),
                key: json!(2),
            },
            EngineEvent::Commit(h),
        ]
    );
    assert_eq!(engine.committed("A").len(), 1);
    assert_eq!(engine.committed("B").len(), 1);
}

async fn db_write(txn: &Transaction, table: &str, id: i64) -> Result<(), TxnError> {
    Table::new(table).put(txn, json!({"_id": id})).await?;
    Ok(())
}

#[tokio::test]
async fn read_then_throw_rolls_back_and_wraps_the_cause() {
    let engine = engine(&["A"]);
    let db = Database::open(engine.clone(), schema(&["A"])).await.unwrap();

    let err = db
        .transaction(|txn| async move {
            Table::new("A").get(&txn, &json!("x")).await?;
            Err::<(), _>(TxnError::user("application failure"))
        })
        .await
        .unwrap_err();

    let h = NativeHandle(1);
    assert_eq!(
        engine.events(),
        vec![
            EngineEvent::Open {
                handle: h,
                tables: ["A".to_string()].into_iter().collect(),
                mode: LockMode::Read,
            },
            EngineEvent::Get {
                handle: h,
                table: "A".into(),
            },
            EngineEvent::Rollback(h),
        ]
    );
    match &err {
        TxnError::TransactionFailed { message, source } => {
            assert_eq!(message, "application failure");
            assert!(matches!(**source, TxnError::User(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn real_side_effects_happen_once() {
    let engine = engine(&["events"]);
    let coordinator = Coordinator::new(engine.clone());
    let effects = Arc::new(AtomicUsize::new(0));
    let invocations = Arc::new(AtomicUsize::new(0));

    let (e, i) = (effects.clone(), invocations.clone());
    coordinator
        .run(move |txn| {
            let (effects, invocations) = (e.clone(), i.clone());
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Table::new("events").put(&txn, json!({"_id": "e1"})).await?;
                if !txn.is_planning_phase() {
                    effects.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(effects.load(Ordering::SeqCst), 1);
    let puts = engine
        .events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Put { .. }))
        .count();
    assert_eq!(puts, 1);
}

#[tokio::test]
async fn failure_after_writes_leaves_nothing_behind() {
    let engine = engine(&["A", "B"]);
    let coordinator = Coordinator::new(engine.clone());

    let err = coordinator
        .run(|txn| async move {
            for id in 0..5 {
                Table::new("A").put(&txn, json!({"_id": id})).await?;
                Table::new("B").put(&txn, json!({"_id": id})).await?;
            }
            if txn.is_planning_phase() {
                Ok(())
            } else {
                Err(TxnError::user("fail after writes"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TxnError::TransactionFailed { .. }));
    assert!(engine.committed("A").is_empty());
    assert!(engine.committed("B").is_empty());
    assert_eq!(engine.open_transactions(), 0);
}

#[tokio::test]
async fn nested_tables_join_the_outer_native_transaction() {
    let engine = engine(&["A", "B"]);
    let coordinator = Coordinator::new(engine.clone());

    coordinator
        .run(|txn| async move {
            Table::new("A").count(&txn).await?;
            txn.nested(|inner| async move {
                Table::new("B").put(&inner, json!({"_id": 1})).await?;
                Ok(())
            })
            .await
        })
        .await
        .unwrap();

    let opens: Vec<_> = engine
        .events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::Open { tables, mode, .. } => Some((tables, mode)),
            _ => None,
        })
        .collect();
    assert_eq!(
        opens,
        vec![(
            ["A".to_string(), "B".to_string()].into_iter().collect(),
            LockMode::ReadWrite
        )]
    );
}

#[tokio::test]
async fn run_as_dispatches_on_kind() {
    let engine = engine(&["A"]);
    let coordinator = Coordinator::new(engine.clone());

    let count = coordinator
        .run_as(TransactionKind::TopLevel, None, |txn| async move {
            Table::new("A").put(&txn, json!({"_id": 1})).await?;
            Table::new("A").count(&txn).await
        })
        .await
        .unwrap();
    assert_eq!(count, 1);

    let err = coordinator
        .run_as(TransactionKind::Nested, None, |txn| async move {
            Table::new("A").count(&txn).await
        })
        .await
        .unwrap_err();
    assert!(err.is_usage());

    let err = coordinator
        .run_as(TransactionKind::Upgrade, None, |txn| async move {
            Table::new("A").count(&txn).await
        })
        .await
        .unwrap_err();
    assert!(err.is_usage());
}

#[tokio::test]
async fn strict_planning_surfaces_planning_errors() {
    let engine = engine(&["A"]);
    let db = Database::open_with_config(
        engine.clone(),
        schema(&["A"]),
        DatabaseConfig::new().discard_planning_errors(false),
    )
    .await
    .unwrap();

    let err = db
        .transaction(|txn| async move {
            let doc = Table::new("A").get(&txn, &json!(1)).await?;
            doc.ok_or_else(|| TxnError::user("not found"))
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not found"));
    // failed in planning: the engine was never asked for a transaction
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn document_validation_fails_during_planning() {
    let engine = engine(&["A"]);
    let db = Database::open(engine.clone(), schema(&["A"])).await.unwrap();

    let err = db
        .transaction(|txn| async move { Table::new("A").put(&txn, json!([1, 2])).await })
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        TxnError::DocumentValidation(_)
    ));
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn crud_inside_one_transaction() {
    let engine = engine(&["users"]);
    let db = Database::open(engine.clone(), schema(&["users"]))
        .await
        .unwrap();
    let users = db.table("users");

    let key = db
        .transaction(|txn| {
            let users = users.clone();
            async move {
                let key = users.put(&txn, json!({"name": "alice", "age": 30})).await?;
                assert!(key.is_string());
                let updated = users.update(&txn, &key, json!({"age": 31})).await?;
                assert_eq!(updated, !txn.is_planning_phase());
                Ok(key)
            }
        })
        .await
        .unwrap();

    let committed = engine.committed("users");
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0]["_id"], key);
    assert_eq!(committed[0]["age"], json!(31));

    let removed = db
        .transaction(|txn| {
            let (users, key) = (users.clone(), key.clone());
            async move { users.delete(&txn, &key).await }
        })
        .await
        .unwrap();
    assert!(removed);
    assert!(engine.committed("users").is_empty());
}

#[tokio::test]
async fn generated_key_feeds_later_operations() {
    let engine = engine(&["users"]);
    let db = Database::open(engine.clone(), schema(&["users"]))
        .await
        .unwrap();

    let found = db
        .transaction(|txn| async move {
            let users = Table::new("users");
            let key = users.put(&txn, json!({"name": "alice"})).await?;
            Ok(users.get(&txn, &key).await?.map(|doc| doc["name"].clone()))
        })
        .await
        .unwrap();

    assert_eq!(found, Some(json!("alice")));
    assert_eq!(engine.committed("users").len(), 1);
}

#[tokio::test]
async fn keys_read_from_stand_ins_are_not_checked_while_planning() {
    let engine = engine(&["users", "audit"]);
    let db = Database::open(engine.clone(), schema(&["users", "audit"]))
        .await
        .unwrap();
    db.transaction(|txn| async move {
        Table::new("users").put(&txn, json!({"_id": "u1", "audit": 7})).await?;
        Table::new("audit").put(&txn, json!({"_id": 7, "seen": false})).await
    })
    .await
    .unwrap();

    let updated = db
        .transaction(|txn| async move {
            let user = Table::new("users").get(&txn, &json!("u1")).await?;
            // null while planning, since the lookup returns None
            let audit_key = user.map(|u| u["audit"].clone()).unwrap_or_default();
            Table::new("audit")
                .update(&txn, &audit_key, json!({"seen": true}))
                .await
        })
        .await
        .unwrap();

    assert!(updated);
    assert_eq!(engine.committed("audit")[0]["seen"], json!(true));
}

#[tokio::test]
async fn update_cannot_change_the_key() {
    let engine = engine(&["users"]);
    let db = Database::open(engine, schema(&["users"])).await.unwrap();
    let err = db
        .transaction(|txn| async move {
            Table::new("users")
                .update(&txn, &json!(1), json!({"_id": 2}))
                .await
        })
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), TxnError::DocumentValidation(_)));
}

#[tokio::test]
async fn conflicting_writers_fail_to_open() {
    let engine = Arc::new(MemoryEngine::with_tables(["A"]).latency(std::time::Duration::from_millis(5)));
    let coordinator = Coordinator::new(engine.clone());

    let slow = coordinator.run(|txn| async move {
        Table::new("A").put(&txn, json!({"_id": 1})).await?;
        txn.wait_for(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(())
        })
        .await
    });
    let fast = async {
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        coordinator
            .run(|txn| async move { Table::new("A").put(&txn, json!({"_id": 2})).await })
            .await
    };

    let (slow, fast) = tokio::join!(slow, fast);
    slow.unwrap();
    let err = fast.unwrap_err();
    assert!(err.to_string().contains("locked"), "{err}");
    assert_eq!(engine.committed("A").len(), 1);
}

#[tokio::test]
async fn stats_count_both_passes() {
    let engine = engine(&["A"]);
    let db = Database::open(engine, schema(&["A"])).await.unwrap();

    db.transaction(|txn| async move { Table::new("A").count(&txn).await })
        .await
        .unwrap();
    let _ = db
        .transaction(|txn| async move {
            Table::new("A").count(&txn).await?;
            Err::<(), _>(TxnError::user("nope"))
        })
        .await;

    let stats = db.stats();
    assert_eq!(stats.planning_passes, 2);
    assert_eq!(stats.executing_passes, 2);
    assert_eq!(stats.native_opens, 2);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.planning_errors_discarded, 1);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["commits"], json!(1));
}

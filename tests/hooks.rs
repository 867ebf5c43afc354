//! Hook chains around transaction boundaries and model calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde_json::{json, Value};
use txscope::hook::{FinalizeKind, HookHandler};
use txscope::link::{LinkError, MemoryLink, Record};
use txscope::model::Condition;
use txscope::transaction::TxState;
use txscope::{Database, EngineConfig, Propagation, TransactionError, TransactionResult, TxContext};

fn setup() -> (MemoryLink, Database) {
    let link = MemoryLink::new();
    let db = Database::new(link.clone(), EngineConfig::default());
    db.exec(&TxContext::new(), "CREATE TABLE t (id INTEGER, name TEXT)", &[])
        .unwrap();
    link.clear_statements();
    (link, db)
}

fn row(id: i64) -> Record {
    [("id".to_string(), json!(id))].into_iter().collect()
}

fn ids(db: &Database) -> Vec<Value> {
    db.query(&TxContext::new(), "SELECT id FROM t ORDER BY id", &[])
        .unwrap()
        .column("id")
}

/// Insert handler that records its name before and after `next`.
fn tracing_insert(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> HookHandler {
    let log = log.clone();
    HookHandler::new().on_insert(move |ctx, inv| {
        log.lock().push(format!("{}:before", name));
        let result = inv.next(ctx);
        log.lock().push(format!("{}:after", name));
        result
    })
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

#[test]
fn test_scopes_nest_connection_handle_model() {
    let (_link, db) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    db.hook(tracing_insert("connection", &log));
    let model = db.model("t").hook(tracing_insert("model", &log));

    db.transaction(&TxContext::new(), Some(tracing_insert("handle", &log)), |ctx| {
        model.clone().ctx(ctx).insert(row(1))?;
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "connection:before",
            "handle:before",
            "model:before",
            "model:after",
            "handle:after",
            "connection:after",
        ]
    );
}

#[test]
fn test_handle_hooks_stay_with_their_transaction() {
    let (_link, db) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));
    db.transaction(&TxContext::new(), Some(tracing_insert("handle", &log)), |ctx| {
        db.model("t").ctx(ctx).insert(row(1))?;
        Ok(())
    })
    .unwrap();
    db.model("t").insert(row(2)).unwrap();
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn test_begin_hook_error_before_next() {
    let (link, db) = setup();
    let (finalized, sink) = counter();
    db.hook(
        HookHandler::new()
            .on_begin(|_, _| Err(TransactionError::hook("not today")))
            .on_finalize(move |ctx, inv| {
                sink.fetch_add(1, Ordering::SeqCst);
                inv.next(ctx)
            }),
    );
    let mut ran = false;
    let err = db
        .transaction(&TxContext::new(), None, |_| {
            ran = true;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TransactionError::Hook(ref m) if m == "not today"));
    assert!(!ran);
    assert_eq!(link.stats().begins, 0);
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
}

#[test]
fn test_begin_hook_error_after_next_discards_session() {
    let (link, db) = setup();
    let (finalized, sink) = counter();
    db.hook(
        HookHandler::new()
            .on_begin(|ctx, inv| {
                inv.next(ctx)?;
                Err(TransactionError::hook("changed my mind"))
            })
            .on_finalize(move |ctx, inv| {
                sink.fetch_add(1, Ordering::SeqCst);
                inv.next(ctx)
            }),
    );
    let err = db.begin(&TxContext::new(), None).unwrap_err();
    assert!(matches!(err, TransactionError::Hook(_)));
    let stats = link.stats();
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.rollbacks, 1);
    assert!(db.active_transactions().is_empty());
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
}

#[test]
fn test_begin_hook_sees_options() {
    let (_link, db) = setup();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let hooks = HookHandler::new().on_begin(move |ctx, inv| {
        *sink.lock() = Some((inv.transaction_id.clone(), inv.read_only));
        inv.next(ctx)
    });
    let handle = db
        .begin_with_options(
            &TxContext::new(),
            Propagation::Required.into(),
            Some(hooks),
        )
        .unwrap();
    assert_eq!(*seen.lock(), Some((handle.id().to_string(), false)));
    handle.rollback().unwrap();
}

#[test]
fn test_commit_hook_veto_rolls_back() {
    let (link, db) = setup();
    let (rollbacks, seen) = counter();
    let hooks = HookHandler::new()
        .on_commit(|_, _| Err(TransactionError::hook("veto")))
        .on_rollback(move |ctx, inv| {
            seen.fetch_add(1, Ordering::SeqCst);
            inv.next(ctx)
        });
    let err = db
        .transaction(&TxContext::new(), Some(hooks), |ctx| {
            db.model("t").ctx(ctx).insert(row(1))?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, TransactionError::Hook(ref m) if m == "veto"));
    assert!(ids(&db).is_empty());
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(link.stats().commits, 0);
    assert_eq!(link.stats().rollbacks, 1);
}

#[test]
fn test_commit_hook_after_next_sees_closed_transaction() {
    let (link, db) = setup();
    let group = db.group().to_string();
    let hooks = HookHandler::new().on_commit(move |ctx, inv| {
        assert!(ctx.transaction(&group).is_some());
        inv.next(ctx)?;
        assert!(ctx.transaction(&group).is_none());
        Err(TransactionError::hook("too late"))
    });
    let err = db
        .transaction(&TxContext::new(), Some(hooks), |ctx| {
            db.model("t").ctx(ctx).insert(row(1))?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, TransactionError::Hook(_)));
    assert_eq!(ids(&db), vec![json!(1)]);
    assert_eq!(link.stats().commits, 1);
    assert_eq!(link.stats().rollbacks, 0);
}

#[test]
fn test_commit_hook_cannot_hide_failed_commit() {
    let (link, db) = setup();
    db.hook(HookHandler::new().on_commit(|ctx, inv| {
        let _ = inv.next(ctx);
        Ok(())
    }));
    let handle = db.begin(&TxContext::new(), None).unwrap();
    let ctx = TxContext::new().with_transaction(handle.clone());
    db.model("t").ctx(&ctx).insert(row(1)).unwrap();

    link.fail_on("COMMIT");
    let err = handle.commit().unwrap_err();
    link.clear_failures();

    assert!(matches!(err, TransactionError::Execution(LinkError::Rejected(_))));
    assert_eq!(handle.state(), TxState::RolledBack);
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().commits, 0);
}

#[test]
fn test_owned_transaction_reports_swallowed_commit_failure() {
    let (link, db) = setup();
    let hooks = HookHandler::new().on_commit(|ctx, inv| {
        let _ = inv.next(ctx);
        Ok(())
    });
    link.fail_on("COMMIT");
    let err = db
        .transaction(&TxContext::new(), Some(hooks), |ctx| {
            db.model("t").ctx(ctx).insert(row(1))?;
            Ok(())
        })
        .unwrap_err();
    link.clear_failures();

    assert!(matches!(err, TransactionError::Execution(LinkError::Rejected(_))));
    assert!(ids(&db).is_empty());
    assert!(db.active_transactions().is_empty());
}

#[test]
fn test_commit_hook_can_query_before_commit() {
    let (_link, db) = setup();
    let (total, sink) = counter();
    let group = db.group().to_string();
    let hooks = HookHandler::new().on_commit(move |ctx, inv| {
        let handle = ctx.transaction(&group).unwrap();
        let rows = handle.query(ctx, "SELECT * FROM t", &[])?;
        sink.store(rows.len(), Ordering::SeqCst);
        inv.next(ctx)
    });
    db.transaction(&TxContext::new(), Some(hooks), |ctx| {
        db.model("t").ctx(ctx).insert_batch(vec![row(1), row(2)])?;
        Ok(())
    })
    .unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 2);
}

#[test]
fn test_rollback_hook_error_still_rolls_back() {
    let (link, db) = setup();
    let hooks = HookHandler::new().on_rollback(|ctx, inv| {
        inv.next(ctx)?;
        Err(TransactionError::hook("rollback hook"))
    });
    let err = db
        .transaction(&TxContext::new(), Some(hooks), |ctx| -> TransactionResult<()> {
            db.model("t").ctx(ctx).insert(row(1))?;
            Err(TransactionError::other("work failed"))
        })
        .unwrap_err();
    assert!(matches!(err, TransactionError::Hook(ref m) if m == "rollback hook"));
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().rollbacks, 1);
}

#[test]
fn test_rollback_hook_short_circuit_still_rolls_back() {
    let (link, db) = setup();
    let hooks = HookHandler::new().on_rollback(|_, _| Ok(()));
    let handle = db.begin(&TxContext::new(), Some(hooks)).unwrap();
    let ctx = TxContext::new().with_transaction(handle.clone());
    db.model("t").ctx(&ctx).insert(row(1)).unwrap();
    handle.rollback().unwrap();
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().rollbacks, 1);
}

#[test]
fn test_finalize_fires_once() {
    let (_link, db) = setup();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    db.hook(HookHandler::new().on_finalize(move |ctx, inv| {
        sink.lock().push((inv.kind, inv.nesting_level));
        inv.next(ctx)
    }));

    let handle = db.begin(&TxContext::new(), None).unwrap();
    handle.commit().unwrap();
    assert!(handle.commit().is_err());
    assert!(handle.rollback().is_err());

    let _ = db.transaction(&TxContext::new(), None, |ctx| {
        db.transaction_with_options(ctx, Propagation::Nested.into(), None, |_| Ok(()))?;
        Err::<(), _>(TransactionError::other("fail"))
    });

    assert_eq!(
        *fired.lock(),
        vec![(FinalizeKind::Commit, 0), (FinalizeKind::Rollback, 0)]
    );
}

#[test]
fn test_joined_call_attaches_hooks_to_owner() {
    let (_link, db) = setup();
    let (commits, sink) = counter();
    let hooks = HookHandler::new().on_commit(move |ctx, inv| {
        sink.fetch_add(1, Ordering::SeqCst);
        inv.next(ctx)
    });
    db.transaction(&TxContext::new(), None, |ctx| {
        db.transaction(ctx, Some(hooks), |_| Ok(()))?;
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        Ok(())
    })
    .unwrap();
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hooks_ignored_without_transaction() {
    let (_link, db) = setup();
    let (begins, sink) = counter();
    let hooks = HookHandler::new().on_begin(move |ctx, inv| {
        sink.fetch_add(1, Ordering::SeqCst);
        inv.next(ctx)
    });
    db.transaction_with_options(&TxContext::new(), Propagation::Supports.into(), Some(hooks), |_| {
        Ok(())
    })
    .unwrap();
    assert_eq!(begins.load(Ordering::SeqCst), 0);
}

#[test]
fn test_update_hook_rewrites_data() {
    let (_link, db) = setup();
    let model = db.model("t").hook(HookHandler::new().on_update(|ctx, mut inv| {
        inv.data.insert("name".into(), json!("stamped"));
        inv.next(ctx)
    }));
    model.insert(row(1)).unwrap();
    let result = model
        .update(row(1), Condition::all().eq("id", 1))
        .unwrap();
    assert_eq!(result.rows_affected, 1);
    let found = model.one(Condition::all().eq("id", 1)).unwrap().unwrap();
    assert_eq!(found.get("name"), Some(&json!("stamped")));
}

#[test]
fn test_select_hook_runs_concurrent_subqueries() {
    let (_link, db) = setup();
    for id in 1..=3 {
        db.model("t").insert(row(id)).unwrap();
    }
    let lookup = db.clone();
    let model = db.model("t").hook(HookHandler::new().on_select(move |ctx, inv| {
        let mut rows = inv.next(ctx)?;
        let counts: Vec<usize> = thread::scope(|scope| {
            let workers: Vec<_> = rows
                .iter()
                .map(|record| {
                    let id = record.get("id").cloned().unwrap_or(Value::Null);
                    let lookup = &lookup;
                    scope.spawn(move || {
                        lookup
                            .query(&TxContext::new(), "SELECT * FROM t WHERE id <= ?", &[id])
                            .map(|rows| rows.len())
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or(Ok(0)))
                .collect::<TransactionResult<Vec<_>>>()
        })?;
        for (record, count) in rows.iter_mut().zip(counts) {
            record.insert("rank".into(), json!(count));
        }
        Ok(rows)
    }));

    let rows = model.all(Condition::all()).unwrap();
    let ranks: Vec<Value> = rows.column("rank");
    let mut ranks: Vec<u64> = ranks.iter().filter_map(Value::as_u64).collect();
    ranks.sort();
    assert_eq!(ranks, vec![1, 2, 3]);
}

#[test]
fn test_concurrent_registration_during_execution() {
    let (_link, db) = setup();
    let (fired, sink) = counter();
    db.hook(HookHandler::new().on_insert(move |ctx, inv| {
        sink.fetch_add(1, Ordering::SeqCst);
        inv.next(ctx)
    }));

    thread::scope(|scope| {
        for worker in 0..4 {
            let db = db.clone();
            scope.spawn(move || {
                for i in 0..10 {
                    let id = worker * 100 + i;
                    db.transaction(&TxContext::new(), None, |ctx| {
                        db.model("t").ctx(ctx).insert(row(id))?;
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
        for _ in 0..2 {
            let db = db.clone();
            scope.spawn(move || {
                for _ in 0..10 {
                    db.hook(HookHandler::new().on_select(|ctx, inv| inv.next(ctx)));
                }
            });
        }
    });

    assert_eq!(fired.load(Ordering::SeqCst), 40);
    assert_eq!(db.hooks().len(), 21);
    assert_eq!(db.model("t").count(Condition::all()).unwrap(), 40);
}

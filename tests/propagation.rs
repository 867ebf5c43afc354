//! Propagation matrix behaviour through the public API.

use std::time::Duration;

use serde_json::{json, Value};
use txscope::link::{LinkError, MemoryLink, Record};
use txscope::model::Condition;
use txscope::{
    Database, EngineConfig, IsolationLevel, Propagation, TransactionError, TransactionResult,
    TxContext, TxOptions,
};

fn setup() -> (MemoryLink, Database) {
    setup_with(EngineConfig::default())
}

fn setup_with(config: EngineConfig) -> (MemoryLink, Database) {
    let link = MemoryLink::new();
    let db = Database::new(link.clone(), config);
    db.exec(&TxContext::new(), "CREATE TABLE t (id INTEGER, name TEXT)", &[])
        .unwrap();
    link.clear_statements();
    (link, db)
}

fn row(id: i64) -> Record {
    [("id".to_string(), json!(id))].into_iter().collect()
}

fn insert(db: &Database, ctx: &TxContext, id: i64) -> TransactionResult<()> {
    db.model("t").ctx(ctx).insert(row(id))?;
    Ok(())
}

fn ids(db: &Database) -> Vec<Value> {
    db.query(&TxContext::new(), "SELECT id FROM t ORDER BY id", &[])
        .unwrap()
        .column("id")
}

fn with(propagation: Propagation) -> TxOptions {
    TxOptions::new(propagation)
}

#[test]
fn test_required_join_issues_single_begin() {
    let (link, db) = setup();
    db.transaction(&TxContext::new(), None, |ctx| {
        insert(&db, ctx, 1)?;
        db.transaction(ctx, None, |inner| insert(&db, inner, 2))
    })
    .unwrap();

    assert_eq!(ids(&db), vec![json!(1), json!(2)]);
    let stats = link.stats();
    assert_eq!(stats.begins, 1);
    assert_eq!(stats.commits, 1);
}

#[test]
fn test_joined_failure_rolls_back_owner() {
    let (link, db) = setup();
    let err = db
        .transaction(&TxContext::new(), None, |ctx| {
            insert(&db, ctx, 1)?;
            db.transaction(ctx, None, |_| -> TransactionResult<()> {
                Err(TransactionError::other("inner failed"))
            })
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "inner failed");
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().rollbacks, 1);
}

#[test]
fn test_requires_new_survives_outer_rollback() {
    let (link, db) = setup();
    let _ = db.transaction(&TxContext::new(), None, |ctx| -> TransactionResult<()> {
        let outer = ctx.transaction(db.group()).unwrap();
        insert(&db, ctx, 1)?;
        db.transaction_with_options(ctx, with(Propagation::RequiresNew), None, |inner| {
            let handle = inner.transaction(db.group()).unwrap();
            assert_ne!(handle.id(), outer.id());
            assert_eq!(handle.parent_id(), Some(outer.id()));
            assert_eq!(handle.depth(), 1);
            assert!(outer.is_suspended());
            insert(&db, inner, 2)
        })?;
        assert!(!outer.is_suspended());
        Err(TransactionError::other("outer failed"))
    });

    assert_eq!(ids(&db), vec![json!(2)]);
    let stats = link.stats();
    assert_eq!(stats.begins, 2);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
}

#[test]
fn test_requires_new_failure_leaves_outer_intact() {
    let (_link, db) = setup();
    db.transaction(&TxContext::new(), None, |ctx| {
        insert(&db, ctx, 1)?;
        let inner = db.transaction_with_options(ctx, with(Propagation::RequiresNew), None, |inner| {
            insert(&db, inner, 2)?;
            Err::<(), _>(TransactionError::other("inner failed"))
        });
        assert!(inner.is_err());
        Ok(())
    })
    .unwrap();
    assert_eq!(ids(&db), vec![json!(1)]);
}

#[test]
fn test_suspended_handle_rejects_statements() {
    let (_link, db) = setup();
    db.transaction(&TxContext::new(), None, |ctx| {
        let outer = ctx.transaction(db.group()).unwrap();
        db.transaction_with_options(ctx, with(Propagation::RequiresNew), None, |inner| {
            let err = outer.exec(inner, "INSERT INTO t (id) VALUES (9)", &[]).unwrap_err();
            assert!(matches!(err, TransactionError::Suspended(_)));
            assert!(matches!(outer.commit(), Err(TransactionError::Suspended(_))));
            Ok(())
        })
    })
    .unwrap();
    assert!(ids(&db).is_empty());
}

#[test]
fn test_nested_keeps_successful_scopes() {
    let (link, db) = setup();
    db.transaction(&TxContext::new(), None, |ctx| {
        insert(&db, ctx, 5)?;
        let failed = db.transaction_with_options(ctx, with(Propagation::Nested), None, |ctx| {
            insert(&db, ctx, 6)?;
            Err::<(), _>(TransactionError::other("nested failed"))
        });
        assert!(failed.is_err());
        db.transaction_with_options(ctx, with(Propagation::Nested), None, |ctx| {
            insert(&db, ctx, 7)
        })
    })
    .unwrap();

    assert_eq!(ids(&db), vec![json!(5), json!(7)]);
    let statements = link.statements();
    let count = |prefix: &str| statements.iter().filter(|s| s.starts_with(prefix)).count();
    assert_eq!(count("SAVEPOINT"), 2);
    assert_eq!(count("ROLLBACK TO SAVEPOINT"), 1);
    assert_eq!(count("RELEASE SAVEPOINT"), 2);
    assert_eq!(link.stats().begins, 1);
}

#[test]
fn test_nested_without_transaction_starts_one() {
    let (link, db) = setup();
    db.transaction_with_options(&TxContext::new(), with(Propagation::Nested), None, |ctx| {
        assert!(ctx.transaction(db.group()).is_some());
        insert(&db, ctx, 1)
    })
    .unwrap();
    assert_eq!(link.stats().begins, 1);
    assert_eq!(link.stats().commits, 1);
    assert!(!link.statements().iter().any(|s| s.starts_with("SAVEPOINT")));
}

#[test]
fn test_not_supported_writes_survive_outer_rollback() {
    let (_link, db) = setup();
    let _ = db.transaction(&TxContext::new(), None, |ctx| -> TransactionResult<()> {
        insert(&db, ctx, 1)?;
        db.transaction_with_options(ctx, with(Propagation::NotSupported), None, |plain| {
            assert!(plain.transaction(db.group()).is_none());
            insert(&db, plain, 2)
        })?;
        Err(TransactionError::other("outer failed"))
    });
    assert_eq!(ids(&db), vec![json!(2)]);
}

#[test]
fn test_supports_joins_or_runs_plain() {
    let (link, db) = setup();
    db.transaction_with_options(&TxContext::new(), with(Propagation::Supports), None, |ctx| {
        assert!(ctx.transaction(db.group()).is_none());
        Ok(())
    })
    .unwrap();
    assert_eq!(link.stats().begins, 0);

    db.transaction(&TxContext::new(), None, |ctx| {
        let outer = ctx.transaction(db.group()).unwrap();
        db.transaction_with_options(ctx, with(Propagation::Supports), None, |inner| {
            assert_eq!(inner.transaction(db.group()).unwrap().id(), outer.id());
            Ok(())
        })
    })
    .unwrap();
    assert_eq!(link.stats().begins, 1);
}

#[test]
fn test_mandatory_requires_transaction() {
    let (link, db) = setup();
    let mut ran = false;
    let err = db
        .transaction_with_options(&TxContext::new(), with(Propagation::Mandatory), None, |_| {
            ran = true;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_violation());
    assert!(!ran);
    assert_eq!(link.stats().begins, 0);

    db.transaction(&TxContext::new(), None, |ctx| {
        db.transaction_with_options(ctx, with(Propagation::Mandatory), None, |ctx| {
            insert(&db, ctx, 1)
        })
    })
    .unwrap();
    assert_eq!(ids(&db), vec![json!(1)]);
}

#[test]
fn test_never_refuses_transaction() {
    let (_link, db) = setup();
    db.transaction_with_options(&TxContext::new(), with(Propagation::Never), None, |ctx| {
        insert(&db, ctx, 1)
    })
    .unwrap();

    let err = db
        .transaction(&TxContext::new(), None, |ctx| {
            db.transaction_with_options(ctx, with(Propagation::Never), None, |_| Ok(()))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        TransactionError::PropagationViolation {
            propagation: Propagation::Never,
            ..
        }
    ));
    assert_eq!(ids(&db), vec![json!(1)]);
}

#[test]
fn test_panic_becomes_error_and_rolls_back() {
    let (link, db) = setup();
    let err = db
        .transaction(&TxContext::new(), None, |ctx| -> TransactionResult<()> {
            insert(&db, ctx, 1)?;
            panic!("kaboom");
        })
        .unwrap_err();
    match err {
        TransactionError::Panicked { message } => assert!(message.contains("kaboom")),
        other => panic!("expected Panicked, got {:?}", other),
    }
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().rollbacks, 1);
    assert!(db.active_transactions().is_empty());
}

#[test]
fn test_rollback_failure_replaces_work_error() {
    let (link, db) = setup();
    link.fail_on("ROLLBACK");
    let err = db
        .transaction(&TxContext::new(), None, |ctx| -> TransactionResult<()> {
            insert(&db, ctx, 1)?;
            Err(TransactionError::other("work failed"))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Execution(LinkError::Rejected(_))
    ));
}

#[test]
fn test_commit_failure_is_reported() {
    let (link, db) = setup();
    link.fail_on("COMMIT");
    let err = db
        .transaction(&TxContext::new(), None, |ctx| insert(&db, ctx, 1))
        .unwrap_err();
    assert!(matches!(err, TransactionError::Execution(_)));
    assert!(ids(&db).is_empty());
}

#[test]
fn test_cancellation() {
    let (link, db) = setup();

    let (ctx, cancel) = TxContext::new().with_cancel();
    cancel.cancel();
    let err = db.transaction(&ctx, None, |_| Ok(())).unwrap_err();
    assert!(matches!(err, TransactionError::Cancelled));
    assert_eq!(link.stats().begins, 0);

    let (ctx, cancel) = TxContext::new().with_cancel();
    let err = db
        .transaction(&ctx, None, |ctx| {
            insert(&db, ctx, 1)?;
            cancel.cancel();
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TransactionError::Cancelled));
    assert!(ids(&db).is_empty());
    assert_eq!(link.stats().rollbacks, 1);
}

#[test]
fn test_expired_deadline_stops_statements() {
    let (_link, db) = setup();
    let err = db
        .transaction(&TxContext::new(), None, |ctx| {
            let expired = ctx.with_timeout(Duration::ZERO);
            insert(&db, &expired, 1)
        })
        .unwrap_err();
    assert!(matches!(err, TransactionError::Cancelled));
    assert!(ids(&db).is_empty());
}

#[test]
fn test_isolation_and_read_only_options() {
    let (link, db) =
        setup_with(EngineConfig::default().default_isolation(IsolationLevel::RepeatableRead));
    db.transaction(&TxContext::new(), None, |ctx| insert(&db, ctx, 1))
        .unwrap();
    assert_eq!(
        link.count_statements("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
        1
    );

    let options = TxOptions::new(Propagation::Required)
        .isolation(IsolationLevel::Serializable)
        .read_only(true);
    let err = db
        .transaction_with_options(&TxContext::new(), options, None, |ctx| {
            let handle = ctx.transaction(db.group()).unwrap();
            assert_eq!(handle.isolation(), IsolationLevel::Serializable);
            insert(&db, ctx, 2)
        })
        .unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Execution(LinkError::ReadOnly(_))
    ));
    assert_eq!(link.count_statements("SET TRANSACTION READ ONLY"), 1);
    assert_eq!(ids(&db), vec![json!(1)]);
}

#[test]
fn test_groups_do_not_share_bindings() {
    let link = MemoryLink::new();
    let orders = Database::new(link.clone(), EngineConfig::new("orders"));
    let audit = Database::new(link.clone(), EngineConfig::new("audit"));
    orders
        .exec(&TxContext::new(), "CREATE TABLE t (id INTEGER)", &[])
        .unwrap();

    orders
        .transaction(&TxContext::new(), None, |ctx| {
            assert!(ctx.transaction("orders").is_some());
            let err = audit
                .transaction_with_options(ctx, with(Propagation::Mandatory), None, |_| Ok(()))
                .unwrap_err();
            assert!(err.is_violation());
            audit.transaction(ctx, None, |inner| {
                assert!(inner.transaction("orders").is_some());
                assert!(inner.transaction("audit").is_some());
                Ok(())
            })
        })
        .unwrap();
    assert_eq!(link.stats().begins, 2);
}

#[test]
fn test_manual_handle_lifecycle() {
    let (_link, db) = setup();
    let handle = db.begin(&TxContext::new(), None).unwrap();
    let ctx = TxContext::new().with_transaction(handle.clone());
    insert(&db, &ctx, 1).unwrap();
    assert_eq!(db.active_transactions().len(), 1);
    handle.commit().unwrap();

    assert!(ctx.transaction(db.group()).is_none());
    assert!(matches!(
        handle.rollback(),
        Err(TransactionError::NotActive { .. })
    ));
    assert_eq!(db.model("t").count(Condition::all()).unwrap(), 1);
}

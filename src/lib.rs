//! txscope - propagation-aware transactions over a SQL link
//!
//! A [`Database`] wraps a [`link::Link`] and runs work under one of seven
//! propagation policies. The active transaction travels in an explicit
//! [`TxContext`], savepoints back NESTED calls, and hook chains wrap
//! begin/commit/rollback as well as every model CRUD call.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use txscope::link::MemoryLink;
//! use txscope::model::Condition;
//! use txscope::{Database, EngineConfig, Propagation, TransactionError, TxContext};
//!
//! let db = Database::new(MemoryLink::new(), EngineConfig::default());
//! let ctx = TxContext::new();
//! db.exec(&ctx, "CREATE TABLE users (id INTEGER, name TEXT)", &[]).unwrap();
//!
//! let users = db.model("users");
//! let result: Result<(), TransactionError> = db.transaction(&ctx, None, |ctx| {
//!     users.clone().ctx(ctx).insert([("id".to_string(), json!(1))].into_iter().collect())?;
//!
//!     // A failing nested call only undoes its own savepoint.
//!     let _ = db.transaction_with_options(ctx, Propagation::Nested.into(), None, |ctx| {
//!         users.clone().ctx(ctx).insert([("id".to_string(), json!(2))].into_iter().collect())?;
//!         Err::<(), _>(TransactionError::other("undo"))
//!     });
//!     Ok(())
//! });
//! result.unwrap();
//!
//! assert_eq!(users.count(Condition::all()).unwrap(), 1);
//! ```

pub mod db;
pub mod hook;
pub mod link;
pub mod model;
pub mod sql;
pub mod transaction;

pub use db::{Database, DatabaseError, DatabaseResult, EngineConfig};
pub use hook::{HookHandler, HookRegistry};
pub use transaction::{
    IsolationLevel, Propagation, TransactionError, TransactionHandle, TransactionResult,
    TxContext, TxOptions,
};

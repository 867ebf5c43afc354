//! Interceptor chains around transaction boundaries and CRUD execution.
//!
//! Handlers come from three scopes and run outermost first:
//! connection (the [`Database`](crate::Database)), then the transaction
//! handle, then the model. Each handler gets an [`Invocation`]; calling
//! [`Invocation::next`] continues inward, returning without calling it
//! short-circuits. Code before `next` runs in registration order and code
//! after it in reverse.
//!
//! Begin, Commit and Rollback chains cannot skip the physical statement: if
//! a chain returns `Ok` without reaching the end, the engine issues it anyway.

mod chain;
mod input;
mod registry;

pub use chain::{hook_fn, HookFn, Invocation};
pub use input::{
    BeginInput, DeleteInput, FinalizeInput, FinalizeKind, InsertInput, SelectInput, UpdateInput,
};
pub use registry::{HookHandler, HookRegistry};

pub(crate) use chain::run;
pub(crate) use registry::collect;

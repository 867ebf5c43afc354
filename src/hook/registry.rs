//! Hook handlers and the registries that hold them.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::chain::{HookFn, Invocation};
use super::input::{BeginInput, DeleteInput, FinalizeInput, InsertInput, SelectInput, UpdateInput};
use crate::link::{ExecResult, Rows};
use crate::transaction::{TransactionResult, TxContext};

/// A set of optional callbacks, one per hookable operation.
///
/// ```ignore
/// let audit = HookHandler::new()
///     .on_insert(|ctx, mut inv| {
///         for row in inv.data.iter_mut() {
///             row.insert("created_by".into(), json!("system"));
///         }
///         inv.next(ctx)
///     })
///     .on_commit(|ctx, inv| inv.next(ctx));
/// ```
#[derive(Clone, Default)]
pub struct HookHandler {
    pub begin: Option<HookFn<BeginInput, ()>>,
    pub commit: Option<HookFn<FinalizeInput, ()>>,
    pub rollback: Option<HookFn<FinalizeInput, ()>>,
    pub select: Option<HookFn<SelectInput, Rows>>,
    pub insert: Option<HookFn<InsertInput, ExecResult>>,
    pub update: Option<HookFn<UpdateInput, ExecResult>>,
    pub delete: Option<HookFn<DeleteInput, ExecResult>>,
}

macro_rules! hook_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident, $input:ty, $output:ty) => {
        $(#[$doc])*
        pub fn $name<F>(mut self, f: F) -> Self
        where
            F: for<'a> Fn(&TxContext, Invocation<'a, $input, $output>) -> TransactionResult<$output>
                + Send
                + Sync
                + 'static,
        {
            self.$field = Some(Arc::new(f));
            self
        }
    };
}

impl HookHandler {
    pub fn new() -> Self {
        Self::default()
    }

    hook_setter!(
        /// Wrap the physical BEGIN.
        on_begin, begin, BeginInput, ()
    );
    hook_setter!(
        /// Wrap the physical COMMIT.
        on_commit, commit, FinalizeInput, ()
    );
    hook_setter!(
        /// Wrap the physical ROLLBACK.
        on_rollback, rollback, FinalizeInput, ()
    );
    hook_setter!(on_select, select, SelectInput, Rows);
    hook_setter!(on_insert, insert, InsertInput, ExecResult);
    hook_setter!(on_update, update, UpdateInput, ExecResult);
    hook_setter!(on_delete, delete, DeleteInput, ExecResult);

    /// Use one callback for both Commit and Rollback; `input.kind` tells
    /// them apart.
    pub fn on_finalize<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&TxContext, Invocation<'a, FinalizeInput, ()>) -> TransactionResult<()>
            + Send
            + Sync
            + 'static,
    {
        let f: HookFn<FinalizeInput, ()> = Arc::new(f);
        self.commit = Some(f.clone());
        self.rollback = Some(f);
        self
    }

    /// True when no callback is set.
    pub fn is_empty(&self) -> bool {
        self.begin.is_none()
            && self.commit.is_none()
            && self.rollback.is_none()
            && self.select.is_none()
            && self.insert.is_none()
            && self.update.is_none()
            && self.delete.is_none()
    }
}

impl fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandler")
            .field("begin", &self.begin.is_some())
            .field("commit", &self.commit.is_some())
            .field("rollback", &self.rollback.is_some())
            .field("select", &self.select.is_some())
            .field("insert", &self.insert.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .finish()
    }
}

/// An append-only, shareable list of handlers.
///
/// Readers take a snapshot and never block writers for longer than an `Arc`
/// clone, so handlers may be registered while chains are running. Clones
/// share the same list.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    handlers: Arc<RwLock<Arc<Vec<HookHandler>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Chains already running keep their snapshot.
    pub fn register(&self, handler: HookHandler) {
        let mut guard = self.handlers.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(handler);
        *guard = Arc::new(next);
    }

    /// An unshared copy of this registry with `handler` appended.
    pub fn with(&self, handler: HookHandler) -> Self {
        let mut handlers = (*self.snapshot()).clone();
        handlers.push(handler);
        Self {
            handlers: Arc::new(RwLock::new(Arc::new(handlers))),
        }
    }

    /// Handlers registered so far, in registration order.
    pub fn snapshot(&self) -> Arc<Vec<HookHandler>> {
        self.handlers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// Flatten the callbacks picked by `pick` across `scopes`, outermost scope
/// first.
pub(crate) fn collect<P, O>(
    scopes: &[Arc<Vec<HookHandler>>],
    pick: impl Fn(&HookHandler) -> Option<&HookFn<P, O>>,
) -> Vec<HookFn<P, O>> {
    scopes
        .iter()
        .flat_map(|scope| scope.iter())
        .filter_map(|h| pick(h).cloned())
        .collect()
}

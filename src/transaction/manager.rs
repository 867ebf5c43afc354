//! Transaction manager - decides, per call, whether to start, join, suspend
//! or refuse a transaction.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Resolving the propagation policy against the ambient transaction
//! - Opening handles and finalizing the ones it owns
//! - Savepoint scopes for NESTED calls
//! - Turning panics in owned units of work into errors

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::db::EngineConfig;
use crate::hook::{HookHandler, HookRegistry};
use crate::link::Link;
use crate::transaction::context::{Suspension, TxContext};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::{HandleSettings, TransactionHandle, TransactionInfo, WeakHandle};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::propagation::{Propagation, TxOptions};

/// Transaction manager for one connection group.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    link: Arc<dyn Link>,
    config: EngineConfig,
    /// Connection-scope hooks, shared with the owning database.
    hooks: HookRegistry,
    /// Handles this manager opened; closed ones are pruned lazily.
    active: Mutex<Vec<WeakHandle>>,
}

impl TransactionManager {
    /// Create a manager with no connection-scope hooks.
    pub fn new(link: Arc<dyn Link>, config: EngineConfig) -> Self {
        Self::with_hooks(link, config, HookRegistry::new())
    }

    /// Create a manager whose transactions run `hooks` at connection scope.
    pub fn with_hooks(link: Arc<dyn Link>, config: EngineConfig, hooks: HookRegistry) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                link,
                config,
                hooks,
                active: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.inner.link
    }

    /// Connection-scope hooks.
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// Begin a transaction the caller finalizes by hand.
    pub fn begin(
        &self,
        ctx: &TxContext,
        hooks: Option<HookHandler>,
    ) -> TransactionResult<TransactionHandle> {
        self.begin_with_options(ctx, TxOptions::default(), hooks)
    }

    /// Begin a transaction with explicit isolation and access mode.
    ///
    /// The propagation in `options` is ignored: this always opens a new
    /// physical transaction. Binding it to a context is up to the caller.
    pub fn begin_with_options(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
    ) -> TransactionResult<TransactionHandle> {
        self.open(ctx, options, hooks, None)
    }

    /// Run `work` under the configured default propagation.
    pub fn transaction<T, F>(
        &self,
        ctx: &TxContext,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        let options = TxOptions::new(self.inner.config.default_propagation);
        self.execute(ctx, options, hooks, work)
    }

    /// Run `work` under explicit options.
    pub fn transaction_with_options<T, F>(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        self.execute(ctx, options, hooks, work)
    }

    /// Resolve `options.propagation` against the transaction bound to `ctx`
    /// and run `work` accordingly.
    ///
    /// `work` receives the context it must use for statements. Owned
    /// transactions commit when it returns `Ok` and roll back on `Err` or
    /// panic; joined transactions are left to their owner.
    pub fn execute<T, F>(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        ctx.ensure_active()?;
        let group = self.group();
        let current = ctx.transaction(group);
        debug!(
            "propagation {} in group {} (ambient: {})",
            options.propagation,
            group,
            current.as_ref().map(|h| h.id()).unwrap_or("none")
        );

        match (options.propagation, current) {
            (Propagation::Required, Some(handle))
            | (Propagation::Supports, Some(handle))
            | (Propagation::Mandatory, Some(handle)) => self.join(ctx, &handle, hooks, work),

            (Propagation::Required, None) | (Propagation::Nested, None) => {
                self.run_owned(ctx, options, hooks, None, work)
            }

            (Propagation::RequiresNew, current) => {
                let _suspension = Suspension::new(current.clone());
                let detached = ctx.without_transaction(group);
                self.run_owned(&detached, options, hooks, current.as_ref(), work)
            }

            (Propagation::Nested, Some(handle)) => self.run_nested(ctx, &handle, hooks, work),

            (Propagation::Supports, None) | (Propagation::Never, None) => {
                self.run_plain(ctx, hooks, work)
            }

            (Propagation::NotSupported, current) => {
                let _suspension = Suspension::new(current);
                let detached = ctx.without_transaction(group);
                self.run_plain(&detached, hooks, work)
            }

            (Propagation::Mandatory, None) => Err(TransactionError::violation(
                Propagation::Mandatory,
                "no transaction bound to the context",
            )),

            (Propagation::Never, Some(handle)) => Err(TransactionError::violation(
                Propagation::Never,
                format!("transaction {} is bound to the context", handle.id()),
            )),
        }
    }

    /// Open transactions started by this manager.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        let mut active = self.inner.active.lock();
        active.retain(|weak| weak.upgrade().map(|h| !h.is_closed()).unwrap_or(false));
        active
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|h| h.info())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_transactions().len()
    }

    fn open(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
        parent: Option<&TransactionHandle>,
    ) -> TransactionResult<TransactionHandle> {
        let isolation = match options.isolation {
            IsolationLevel::Default => self.inner.config.default_isolation,
            level => level,
        };
        let settings = HandleSettings {
            group: self.group().to_string(),
            isolation,
            read_only: options.read_only,
            depth: parent.map(|p| p.depth() + 1).unwrap_or(0),
            parent_id: parent.map(|p| p.id().to_string()),
            debug: self.inner.config.debug,
        };
        let handle = TransactionHandle::begin(
            ctx,
            self.inner.link.as_ref(),
            settings,
            self.inner.hooks.clone(),
            hooks,
        )?;
        self.inner.active.lock().push(handle.downgrade());
        Ok(handle)
    }

    fn join<T, F>(
        &self,
        ctx: &TxContext,
        handle: &TransactionHandle,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        debug!("joining transaction {}", handle.id());
        if let Some(handler) = hooks {
            handle.hook(handler);
        }
        work(ctx)
    }

    fn run_owned<T, F>(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
        parent: Option<&TransactionHandle>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        let handle = self.open(ctx, options, hooks, parent)?;
        let bound = ctx.with_transaction(handle.clone());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&bound)))
            .unwrap_or_else(|payload| Err(TransactionError::from_panic(payload)));
        let outcome = match outcome {
            Ok(_) if bound.is_cancelled() => Err(TransactionError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(value) => {
                handle.commit()?;
                Ok(value)
            }
            Err(err) => Err(Self::rollback_after(&handle, err)),
        }
    }

    fn run_nested<T, F>(
        &self,
        ctx: &TxContext,
        handle: &TransactionHandle,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        if let Some(handler) = hooks {
            handle.hook(handler);
        }
        let savepoint = handle.begin_nested(ctx)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(ctx)))
            .unwrap_or_else(|payload| Err(TransactionError::from_panic(payload)));

        match outcome {
            Ok(value) => {
                handle.end_nested(&savepoint, true)?;
                Ok(value)
            }
            Err(err) => match handle.end_nested(&savepoint, false) {
                Ok(()) => Err(err),
                Err(rollback_err) => {
                    warn!(
                        "rollback to {} in {} failed ({}); original error: {}",
                        savepoint,
                        handle.id(),
                        rollback_err,
                        err
                    );
                    Err(rollback_err)
                }
            },
        }
    }

    fn run_plain<T, F>(
        &self,
        ctx: &TxContext,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        if hooks.is_some() {
            debug!("no transaction in group {}; ignoring hooks", self.group());
        }
        work(ctx)
    }

    /// Roll `handle` back after `err`. A failing rollback wins.
    fn rollback_after(handle: &TransactionHandle, err: TransactionError) -> TransactionError {
        match handle.rollback() {
            Ok(()) => err,
            Err(rollback_err) => {
                warn!(
                    "rollback of {} failed ({}); original error: {}",
                    handle.id(),
                    rollback_err,
                    err
                );
                rollback_err
            }
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks.len())
            .finish()
    }
}

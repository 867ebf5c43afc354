//! Database API - high-level interface bundling a link, its configuration,
//! connection-scope hooks and the transaction manager.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hook::{HookHandler, HookRegistry};
use crate::link::{ExecResult, Link, LinkError, Rows};
use crate::model::Model;
use crate::sql::ParseError;
use crate::transaction::{
    IsolationLevel, Propagation, TransactionError, TransactionHandle, TransactionInfo,
    TransactionManager, TransactionResult, TxContext, TxOptions,
};

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection group; ambient transactions are bound per group.
    pub group: String,
    /// Propagation used by `transaction`.
    pub default_propagation: Propagation,
    /// Isolation used when a call asks for `IsolationLevel::Default`.
    pub default_isolation: IsolationLevel,
    /// Log every statement at debug level.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group: "default".into(),
            default_propagation: Propagation::Required,
            default_isolation: IsolationLevel::Default,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration for the given group.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    /// Set default_propagation.
    pub fn default_propagation(mut self, value: Propagation) -> Self {
        self.default_propagation = value;
        self
    }

    /// Set default_isolation.
    pub fn default_isolation(mut self, value: IsolationLevel) -> Self {
        self.default_isolation = value;
        self
    }

    /// Set debug flag.
    pub fn debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> DatabaseResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> DatabaseResult<()> {
        if self.group.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig("group must not be empty".into()));
        }
        Ok(())
    }
}

/// The main database handle. Clones share everything.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    link: Arc<dyn Link>,
    config: EngineConfig,
    hooks: HookRegistry,
    manager: TransactionManager,
}

impl Database {
    /// Create a database over `link`.
    pub fn new(link: impl Link + 'static, config: EngineConfig) -> Self {
        Self::from_link(Arc::new(link), config)
    }

    /// Create a database over a shared link.
    pub fn from_link(link: Arc<dyn Link>, config: EngineConfig) -> Self {
        let hooks = HookRegistry::new();
        let manager = TransactionManager::with_hooks(link.clone(), config.clone(), hooks.clone());
        debug!("database ready (group {})", config.group);
        Self {
            inner: Arc::new(DatabaseInner {
                link,
                config,
                hooks,
                manager,
            }),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.inner.link
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.inner.manager
    }

    /// Register a connection-scope handler. It applies to every transaction
    /// begun and every model call made from now on.
    pub fn hook(&self, handler: HookHandler) {
        self.inner.hooks.register(handler);
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// CRUD access to `table`.
    pub fn model(&self, table: &str) -> Model {
        Model::new(
            table,
            self.inner.link.clone(),
            self.inner.config.group.clone(),
            self.inner.config.debug,
            self.inner.hooks.clone(),
        )
    }

    /// Begin a transaction the caller finalizes by hand.
    pub fn begin(
        &self,
        ctx: &TxContext,
        hooks: Option<HookHandler>,
    ) -> TransactionResult<TransactionHandle> {
        self.inner.manager.begin(ctx, hooks)
    }

    pub fn begin_with_options(
        &self,
        ctx: &TxContext,
        options: TxOptions,
        hooks: Option<HookHandler>,
    ) -> TransactionResult<TransactionHandle> {
        self.inner.manager.begin_with_options(ctx, options, hooks)
    }

    /// Run `work` under the default propagation.
    pub fn transaction<T, F>(
        &self,
        ctx: &TxContext,
        hooks: Option<HookHandler>,
        work: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&TxContext) -> TransactionResult<T>,
    {
        self.inner.manager.transaction(ctx, hooks, work)
    }

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
        self.inner.manager.transaction_with_options(ctx, options, hooks, work)
    }

    /// Run a raw query in the transaction bound to `ctx`, or on the link.
    pub fn query(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<Rows> {
        ctx.ensure_active()?;
        match ctx.transaction(self.group()) {
            Some(handle) => handle.query(ctx, sql, args),
            None => {
                self.log_sql(sql, args);
                Ok(self.inner.link.query(sql, args)?)
            }
        }
    }

    /// Run a raw statement in the transaction bound to `ctx`, or on the link.
    pub fn exec(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<ExecResult> {
        ctx.ensure_active()?;
        match ctx.transaction(self.group()) {
            Some(handle) => handle.exec(ctx, sql, args),
            None => {
                self.log_sql(sql, args);
                Ok(self.inner.link.exec(sql, args)?)
            }
        }
    }

    /// Open transactions started through this database.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.inner.manager.active_transactions()
    }

    fn log_sql(&self, sql: &str, args: &[Value]) {
        if self.inner.config.debug {
            debug!("[{}] {} {:?}", self.inner.config.group, sql, args);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.inner.config)
            .field("hooks", &self.inner.hooks.len())
            .finish()
    }
}

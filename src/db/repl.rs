//! Interactive REPL (Read-Eval-Print Loop) driving a [`Database`].
//!
//! BEGIN opens a hand-managed transaction that every later statement runs
//! in until COMMIT or ROLLBACK. SAVEPOINT, ROLLBACK TO and RELEASE go through
//! the transaction's savepoint bookkeeping rather than straight to the link.

use std::io::{self, BufRead, Write};

use super::api::{Database, DatabaseError, DatabaseResult};
use crate::link::{ExecResult, Rows};
use crate::sql::{Parser, Statement};
use crate::transaction::{
    IsolationLevel, TransactionError, TransactionHandle, TxContext, TxOptions,
};

/// REPL configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Show timing information.
    pub timing: bool,
    /// Max rows to display.
    pub max_rows: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "txscope> ".into(),
            timing: true,
            max_rows: 100,
        }
    }
}

/// What one statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Rows(Rows),
    Modified(ExecResult),
    Message(String),
}

/// The interactive REPL.
pub struct Repl {
    db: Database,
    config: ReplConfig,
    history: Vec<String>,
    options: TxOptions,
    current: Option<TransactionHandle>,
}

impl Repl {
    /// Create a new REPL with the given database.
    pub fn new(db: Database) -> Self {
        Self::with_config(db, ReplConfig::default())
    }

    /// Create a REPL with custom configuration.
    pub fn with_config(db: Database, config: ReplConfig) -> Self {
        Self {
            db,
            config,
            history: Vec::new(),
            options: TxOptions::default(),
            current: None,
        }
    }

    /// The transaction opened by BEGIN, while it is open.
    pub fn current(&self) -> Option<&TransactionHandle> {
        self.current.as_ref().filter(|h| !h.is_closed())
    }

    /// Run one SQL statement, transaction control included.
    pub fn execute(&mut self, sql: &str) -> DatabaseResult<Output> {
        let stmt = Parser::parse(sql)?;
        match stmt {
            Statement::Begin => {
                if let Some(open) = self.current() {
                    return Err(TransactionError::InvalidOperation(format!(
                        "transaction {} already open",
                        open.id()
                    ))
                    .into());
                }
                let handle = self.db.begin_with_options(&TxContext::new(), self.options, None)?;
                let message = format!("BEGIN {}", handle.id());
                self.current = Some(handle);
                Ok(Output::Message(message))
            }
            Statement::Commit => {
                self.take_current()?.commit()?;
                Ok(Output::Message("COMMIT".into()))
            }
            Statement::Rollback => {
                self.take_current()?.rollback()?;
                Ok(Output::Message("ROLLBACK".into()))
            }
            Statement::Savepoint(name) => {
                self.require_current()?.save_point(&name)?;
                Ok(Output::Message(format!("SAVEPOINT {}", name)))
            }
            Statement::RollbackTo(name) => {
                self.require_current()?.rollback_to(&name)?;
                Ok(Output::Message(format!("ROLLBACK TO {}", name)))
            }
            Statement::ReleaseSavepoint(name) => {
                self.require_current()?.release_savepoint(&name)?;
                Ok(Output::Message(format!("RELEASE {}", name)))
            }
            Statement::Select(_) => {
                let ctx = self.context();
                Ok(Output::Rows(self.db.query(&ctx, sql, &[])?))
            }
            _ => {
                let ctx = self.context();
                Ok(Output::Modified(self.db.exec(&ctx, sql, &[])?))
            }
        }
    }

    /// Run the REPL interactively.
    pub fn run(&mut self) -> DatabaseResult<()> {
        self.print_banner();

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut input = String::new();
        let mut multiline = false;

        loop {
            // Print prompt.
            let prompt = if multiline { "     -> " } else { &self.config.prompt };
            print!("{}", prompt);
            stdout.flush()?;

            // Read line.
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                // EOF.
                println!("\nGoodbye!");
                break;
            }

            let line = line.trim_end();

            if line.is_empty() && !multiline {
                continue;
            }

            if multiline {
                input.push(' ');
            }
            input.push_str(line);

            // Continue until the statement ends with a semicolon.
            if !input.ends_with(';') && !is_command(&input) {
                multiline = true;
                continue;
            }
            multiline = false;

            let cmd = input.trim().to_string();
            input.clear();

            if cmd.is_empty() {
                continue;
            }

            self.history.push(cmd.clone());

            if is_command(&cmd) {
                match self.handle_command(&cmd) {
                    Ok(should_exit) if should_exit => break,
                    Err(e) => eprintln!("Error: {}", e),
                    _ => {}
                }
                continue;
            }

            let start = std::time::Instant::now();
            match self.execute(&cmd) {
                Ok(output) => {
                    self.print_output(&output);
                    if self.config.timing {
                        println!("Time: {:.3}ms", start.elapsed().as_secs_f64() * 1000.0);
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        if let Some(handle) = self.current.take().filter(|h| !h.is_closed()) {
            println!("Rolling back open transaction {}", handle.id());
            handle.rollback()?;
        }

        Ok(())
    }

    /// Handle a dot command. Returns true when the REPL should exit.
    pub fn handle_command(&mut self, cmd: &str) -> DatabaseResult<bool> {
        let cmd = cmd.trim_start_matches(&['.', '\\'][..]);
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let command = parts.first().map(|s| s.to_lowercase());

        match command.as_deref() {
            Some("help") | Some("h") | Some("?") => {
                self.print_help();
            }
            Some("quit") | Some("exit") | Some("q") => {
                return Ok(true);
            }
            Some("status") => match self.current() {
                Some(handle) => println!("{}", serde_json::to_string_pretty(&handle.info())?),
                None => println!("No open transaction."),
            },
            Some("active") => {
                let active = self.db.active_transactions();
                println!("{}", serde_json::to_string_pretty(&active)?);
            }
            Some("isolation") => match parts.get(1..) {
                Some(rest) if !rest.is_empty() => {
                    let level: IsolationLevel = rest
                        .join(" ")
                        .parse()
                        .map_err(DatabaseError::InvalidConfig)?;
                    self.options = self.options.isolation(level);
                    println!("Isolation for next BEGIN: {}", level);
                }
                _ => println!("Isolation for next BEGIN: {}", self.options.isolation),
            },
            Some("readonly") => {
                let on = matches!(parts.get(1).map(|s| s.to_lowercase()).as_deref(), Some("on"));
                self.options = self.options.read_only(on);
                println!("Read-only for next BEGIN: {}", if on { "on" } else { "off" });
            }
            Some("history") => {
                self.print_history();
            }
            Some("timing") => {
                self.config.timing = !self.config.timing;
                println!("Timing: {}", if self.config.timing { "on" } else { "off" });
            }
            Some(cmd) => {
                eprintln!("Unknown command: .{}", cmd);
                eprintln!("Type .help for available commands");
            }
            None => {}
        }

        Ok(false)
    }

    fn context(&self) -> TxContext {
        match self.current() {
            Some(handle) => TxContext::new().with_transaction(handle.clone()),
            None => TxContext::new(),
        }
    }

    fn require_current(&self) -> DatabaseResult<&TransactionHandle> {
        self.current()
            .ok_or_else(|| TransactionError::InvalidOperation("no open transaction".into()).into())
    }

    fn take_current(&mut self) -> DatabaseResult<TransactionHandle> {
        self.require_current()?;
        self.current
            .take()
            .ok_or_else(|| TransactionError::InvalidOperation("no open transaction".into()).into())
    }

    fn print_banner(&self) {
        println!("txscope v{}", env!("CARGO_PKG_VERSION"));
        println!("Type .help for commands, or enter SQL statements");
        println!();
    }

    fn print_help(&self) {
        println!("Commands:");
        println!("  .help, .h, .?           Show this help message");
        println!("  .quit, .exit, .q        Exit the REPL");
        println!("  .status                 Show the open transaction");
        println!("  .active                 List open transactions");
        println!("  .isolation [LEVEL]      Show or set isolation for the next BEGIN");
        println!("  .readonly on|off        Make the next BEGIN read-only");
        println!("  .history                Show command history");
        println!("  .timing                 Toggle timing display");
        println!();
        println!("SQL Statements:");
        println!("  CREATE TABLE name (columns...)");
        println!("  DROP TABLE name");
        println!("  INSERT INTO table (cols) VALUES (vals)");
        println!("  SELECT cols FROM table [WHERE ...] [ORDER BY ...] [LIMIT ...]");
        println!("  UPDATE table SET col=val [WHERE ...]");
        println!("  DELETE FROM table [WHERE ...]");
        println!("  BEGIN / COMMIT / ROLLBACK");
        println!("  SAVEPOINT name / ROLLBACK TO name / RELEASE name");
        println!();
    }

    fn print_history(&self) {
        println!("Command History:");
        for (i, cmd) in self.history.iter().enumerate() {
            println!("  {}: {}", i + 1, cmd);
        }
    }

    fn print_output(&self, output: &Output) {
        match output {
            Output::Message(message) => println!("{}", message),
            Output::Modified(result) => println!("{} row(s) modified", result.rows_affected),
            Output::Rows(rows) => print!("{}", render_rows(rows, self.config.max_rows)),
        }
    }
}

fn is_command(input: &str) -> bool {
    input.starts_with('.') || input.starts_with('\\')
}

/// Render rows as an aligned text table.
pub fn render_rows(rows: &Rows, max_rows: usize) -> String {
    if rows.is_empty() {
        return "(0 rows)\n".to_string();
    }

    let columns: Vec<String> = if rows.columns.is_empty() {
        rows.rows[0].keys().cloned().collect()
    } else {
        rows.columns.clone()
    };

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows.iter() {
        for (i, col) in columns.iter().enumerate() {
            if let Some(val) = row.get(col) {
                widths[i] = widths[i].max(format_value(val).len());
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
        .collect();
    out.push_str(&header.join(" | "));
    out.push('\n');

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&sep.join("-+-"));
    out.push('\n');

    let limit = rows.len().min(max_rows);
    for row in rows.iter().take(limit) {
        let values: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let val = row.get(col).map(format_value).unwrap_or_default();
                format!("{:width$}", val, width = widths[i])
            })
            .collect();
        out.push_str(&values.join(" | "));
        out.push('\n');
    }

    if rows.len() > limit {
        out.push_str(&format!("... ({} more rows)\n", rows.len() - limit));
    }
    out.push_str(&format!("({} rows)\n", rows.len()));
    out
}

/// Format a value for display.
pub fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

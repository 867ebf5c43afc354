//! SQL subset understood by the in-memory link.
//!
//! Uses the `sqlparser` crate for parsing, then converts to an internal AST
//! that `MemoryLink` evaluates directly.

mod ast;
mod error;
mod eval;
mod parser;

pub use ast::*;
pub use error::{ParseError, ParseResult};
pub use eval::{evaluate, matches_where, values_equal, EvalError};
pub(crate) use eval::compare_values;
pub use parser::{is_identifier, Parser};

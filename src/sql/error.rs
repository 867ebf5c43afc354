//! Errors raised while turning SQL text into a [`Statement`](super::Statement).

use thiserror::Error;

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{kind} not supported by the memory link: {detail}")]
    Unsupported { kind: &'static str, detail: String },

    #[error("{0:?} is not a plain identifier")]
    InvalidIdentifier(String),

    #[error("expected {0}")]
    Expected(String),

    #[error("empty statement")]
    Empty,

    #[error("only one statement per call")]
    MultipleStatements,
}

impl ParseError {
    pub(crate) fn statement(detail: impl Into<String>) -> Self {
        ParseError::Unsupported {
            kind: "statement",
            detail: detail.into(),
        }
    }

    pub(crate) fn expression(detail: impl Into<String>) -> Self {
        ParseError::Unsupported {
            kind: "expression",
            detail: detail.into(),
        }
    }
}

impl From<sqlparser::parser::ParserError> for ParseError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        ParseError::Syntax(e.to_string())
    }
}

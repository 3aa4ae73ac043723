//! SQL error types

use sqlparser::parser::ParserError;
use sqlparser::tokenizer::TokenizerError;
use thiserror::Error;

/// Errors from turning statement text into the AST
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    /// Tokenizer or grammar error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Valid SQL this node does not handle
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<TokenizerError> for SqlError {
    fn from(err: TokenizerError) -> Self {
        SqlError::Parse(err.to_string())
    }
}

impl From<ParserError> for SqlError {
    fn from(err: ParserError) -> Self {
        SqlError::Parse(err.to_string())
    }
}

/// Result type for SQL operations
pub type SqlResult<T> = Result<T, SqlError>;

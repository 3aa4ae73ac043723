//! SQL layer
//!
//! This module provides:
//! - `Parser`: Parses SQL text into the internal AST
//! - `ast`: Statement, DDL and expression types
//! - `expr`: Lowering of sqlparser expressions into `ast::Expr`

pub mod ast;
pub mod error;
pub mod expr;
pub mod parser;

pub use ast::*;
pub use error::{SqlError, SqlResult};
pub use parser::Parser;

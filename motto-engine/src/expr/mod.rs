//! Restricted expression grammar
//!
//! The closed grammar behind conditions, guards, and event filters:
//! boolean/numeric/string literals, identifiers resolved against the
//! evaluation scope, arithmetic, comparison, `and`/`or`/`not`,
//! parentheses, and the fixed pure functions `status("key")`, `now()`,
//! `elapsed("marker")`, `count("key")`, `has("key")`. No assignment, no
//! loops, no side effects — one evaluation always terminates.
//!
//! Evaluation is sandboxed: undefined identifiers, division by zero, and
//! overflow produce a typed [`ExprError`], never a silent null. Operands
//! are evaluated eagerly, so `undefined_id or true` is still an error.

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::{BinOp, Expr, Func, UnaryOp};
pub use eval::{eval, type_check, EvalScope, MapScope};
pub use lexer::{lex, Token, TokenKind};
pub use parser::parse;

use serde::Serialize;
use thiserror::Error;

/// Errors produced while lexing, parsing, typing, or evaluating an
/// expression.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprError {
    /// Unexpected character while lexing
    #[error("lex error at offset {pos}: {message}")]
    Lex {
        /// Byte offset into the source
        pos: usize,
        /// What went wrong
        message: String,
    },

    /// Malformed expression
    #[error("parse error at offset {pos}: {message}")]
    Parse {
        /// Byte offset into the source
        pos: usize,
        /// What went wrong
        message: String,
    },

    /// Identifier not present in the evaluation scope or declaration
    #[error("undefined identifier '{name}'")]
    Undefined {
        /// The unresolved name
        name: String,
    },

    /// Operand types do not fit the operator or function
    #[error("type error: {message}")]
    Type {
        /// What was expected and what was found
        message: String,
    },

    /// Division by zero
    #[error("division by zero")]
    DivByZero,

    /// Arithmetic left the finite f64 range
    #[error("numeric overflow")]
    Overflow,

    /// Call of a function outside the fixed set
    #[error("unknown function '{name}'")]
    UnknownFunction {
        /// The unrecognized function name
        name: String,
    },
}

/// Parse source text into an expression tree.
///
/// Convenience wrapper over [`lex`] + [`parse`].
pub fn compile(source: &str) -> Result<Expr, ExprError> {
    parse(&lex(source)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scalar;

    #[test]
    fn compile_and_eval_round_trip() {
        let expr = compile("(1 + 2) * 3 == 9").expect("compiles");
        let scope = MapScope::default();
        assert_eq!(eval(&expr, &scope).unwrap(), Scalar::Bool(true));
    }

    #[test]
    fn rejects_unknown_function() {
        let err = compile("shutdown(\"now\")").unwrap_err();
        assert!(matches!(err, ExprError::UnknownFunction { .. }));
    }
}

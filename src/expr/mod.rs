//! Expression language
//!
//! A small, sandboxed evaluator for the expressions embedded in scenario
//! definitions: request templates (`Bearer ${token}`), response validations
//! (`res.code === 200`), message filters (`msg.type == 'alert'`) and
//! variable sources. Expressions can only read the names bound for them
//! (`res`, `head`, `msg` and cache keys); there is no assignment, no
//! function definition and no access to the host.

mod eval;
mod lexer;
mod parser;
mod template;

use thiserror::Error;

pub use eval::{display, evaluate, number, truthy, Scope};
pub use parser::{parse, BinaryOp, Expr, UnaryOp};
pub use template::{
    compile, eval_expression, eval_predicate, has_expressions, resolve_map, resolve_str,
    resolve_string, resolve_value, root_name, Bindings,
};

/// Failure to parse or evaluate an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("cannot read '{0}' of null")]
    NullAccess(String),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("in `{expression}`: {source}")]
    Within {
        expression: String,
        #[source]
        source: Box<ExpressionError>,
    },
}

impl ExpressionError {
    /// Attach the expression text, once
    pub fn within(self, expression: &str) -> Self {
        match self {
            already @ ExpressionError::Within { .. } => already,
            other => ExpressionError::Within {
                expression: expression.to_string(),
                source: Box::new(other),
            },
        }
    }
}

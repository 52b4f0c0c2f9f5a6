#![forbid(unsafe_code)]

mod eval;
mod filter;
mod parse;

use std::collections::BTreeSet;

use pc_types::ScalarValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use eval::{FUNCTIONS, FunctionSpec};
pub use filter::{Combiner, FilterOp, FilterTerm};
pub use parse::parse_expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Column {
        name: String,
    },
    Literal {
        value: ScalarValue,
    },
    Neg {
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Column names referenced anywhere in the tree, sorted and deduplicated.
    #[must_use]
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Self::Column { name } => {
                    out.insert(name.clone());
                }
                Self::Literal { .. } => {}
                Self::Neg { expr } | Self::Not { expr } => stack.push(expr),
                Self::Binary { left, right, .. }
                | Self::Compare { left, right, .. }
                | Self::And { left, right }
                | Self::Or { left, right } => {
                    stack.push(left);
                    stack.push(right);
                }
                Self::Call { args, .. } => stack.extend(args.iter()),
            }
        }
        out
    }

    fn calls(&self) -> Vec<(&str, usize)> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Self::Call { function, args } => {
                    out.push((function.as_str(), args.len()));
                    stack.extend(args.iter());
                }
                Self::Neg { expr } | Self::Not { expr } => stack.push(expr),
                Self::Binary { left, right, .. }
                | Self::Compare { left, right, .. }
                | Self::And { left, right }
                | Self::Or { left, right } => {
                    stack.push(left);
                    stack.push(right);
                }
                Self::Column { .. } | Self::Literal { .. } => {}
            }
        }
        out
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown column reference: {0}")]
    UnknownColumn(String),
    #[error("function {function} takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },
    #[error("invalid operand for {op}: {reason}")]
    InvalidOperand { op: String, reason: String },
    /// Configuration or build bug; callers must not continue the update.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ExprError {
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// A compiled computed-column formula over named inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    source: String,
    expr: Expr,
    inputs: Vec<String>,
}

impl Formula {
    /// Parses `source` and resolves every function it calls. A call to an
    /// undefined function is an invariant violation, not a parse error.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let expr = parse_expr(source)?;
        for (name, argc) in expr.calls() {
            let spec = eval::lookup(name).ok_or_else(|| {
                ExprError::InvariantViolation(format!("formula calls undefined function {name}"))
            })?;
            spec.check_arity(argc)?;
        }
        let inputs = expr.columns().into_iter().collect();
        Ok(Self {
            source: source.to_owned(),
            expr,
            inputs,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn evaluate<F>(&self, resolve: F) -> Result<ScalarValue, ExprError>
    where
        F: Fn(&str) -> Option<ScalarValue>,
    {
        eval::evaluate(&self.expr, &resolve)
    }
}

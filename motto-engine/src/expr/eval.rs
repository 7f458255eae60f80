//! Type checking and sandboxed evaluation.

use std::collections::BTreeMap;

use super::ast::{BinOp, Expr, Func, UnaryOp};
use super::ExprError;
use crate::model::{FieldType, Scalar};

/// Read-only view an expression is evaluated against.
///
/// Implementations expose the variable scope chain, the status board,
/// emission counters, and time markers. Nothing here can mutate state.
pub trait EvalScope {
    /// Resolve an identifier.
    fn lookup(&self, name: &str) -> Option<Scalar>;

    /// Resolve a status-board key for `status("key")`.
    fn status(&self, key: &str) -> Option<Scalar>;

    /// Emission count for `count("key")`; keys never observed count 0.
    fn count(&self, key: &str) -> f64;

    /// Seconds since the named marker, for `elapsed("marker")`.
    fn elapsed(&self, marker: &str) -> Option<f64>;

    /// Seconds since the execution started, for `now()`.
    fn now(&self) -> f64;

    /// Presence check for `has("key")`.
    fn has(&self, key: &str) -> bool {
        self.status(key).is_some() || self.lookup(key).is_some()
    }
}

/// Map-backed scope for filters, tests, and detached evaluation.
#[derive(Debug, Clone, Default)]
pub struct MapScope {
    /// Identifier bindings
    pub vars: BTreeMap<String, Scalar>,
    /// Status-board entries
    pub statuses: BTreeMap<String, Scalar>,
    /// Emission counters
    pub counts: BTreeMap<String, f64>,
    /// Marker name → seconds since it was set
    pub markers: BTreeMap<String, f64>,
    /// Seconds since the execution started
    pub now_seconds: f64,
}

impl MapScope {
    /// Add an identifier binding.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add a status-board entry.
    pub fn with_status(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.statuses.insert(key.into(), value.into());
        self
    }
}

impl EvalScope for MapScope {
    fn lookup(&self, name: &str) -> Option<Scalar> {
        self.vars.get(name).cloned()
    }

    fn status(&self, key: &str) -> Option<Scalar> {
        self.statuses.get(key).cloned()
    }

    fn count(&self, key: &str) -> f64 {
        self.counts.get(key).copied().unwrap_or(0.0)
    }

    fn elapsed(&self, marker: &str) -> Option<f64> {
        self.markers.get(marker).copied()
    }

    fn now(&self) -> f64 {
        self.now_seconds
    }
}

fn type_name(t: FieldType) -> &'static str {
    match t {
        FieldType::Bool => "bool",
        FieldType::Num => "num",
        FieldType::Str => "str",
    }
}

fn scalar_type(v: &Scalar) -> FieldType {
    match v {
        Scalar::Bool(_) => FieldType::Bool,
        Scalar::Num(_) => FieldType::Num,
        Scalar::Str(_) => FieldType::Str,
    }
}

/// Statically type an expression against declared fields.
///
/// Identifiers must appear in `fields`; the fixed functions type as
/// `status/count/elapsed/now → num` and `has → bool`. Used by the
/// validator to require conditions and filters to be boolean.
pub fn type_check(expr: &Expr, fields: &BTreeMap<String, FieldType>) -> Result<FieldType, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(scalar_type(v)),
        Expr::Ident(name) => fields
            .get(name)
            .copied()
            .ok_or_else(|| ExprError::Undefined { name: name.clone() }),
        Expr::Call { func, .. } => Ok(match func {
            Func::Has => FieldType::Bool,
            Func::Status | Func::Now | Func::Elapsed | Func::Count => FieldType::Num,
        }),
        Expr::Unary { op, operand } => {
            let inner = type_check(operand, fields)?;
            match op {
                UnaryOp::Not => expect_type(FieldType::Bool, inner, "not").map(|_| FieldType::Bool),
                UnaryOp::Neg => expect_type(FieldType::Num, inner, "-").map(|_| FieldType::Num),
            }
        }
        Expr::Binary { op, left, right } => {
            let lt = type_check(left, fields)?;
            let rt = type_check(right, fields)?;
            match op {
                BinOp::And | BinOp::Or => {
                    expect_type(FieldType::Bool, lt, "and/or")?;
                    expect_type(FieldType::Bool, rt, "and/or")?;
                    Ok(FieldType::Bool)
                }
                BinOp::Eq | BinOp::Ne => {
                    if lt != rt {
                        return Err(ExprError::Type {
                            message: format!(
                                "cannot compare {} with {}",
                                type_name(lt),
                                type_name(rt)
                            ),
                        });
                    }
                    Ok(FieldType::Bool)
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                    expect_type(FieldType::Num, lt, "comparison")?;
                    expect_type(FieldType::Num, rt, "comparison")?;
                    Ok(FieldType::Bool)
                }
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                    expect_type(FieldType::Num, lt, "arithmetic")?;
                    expect_type(FieldType::Num, rt, "arithmetic")?;
                    Ok(FieldType::Num)
                }
            }
        }
    }
}

fn expect_type(expected: FieldType, found: FieldType, what: &str) -> Result<(), ExprError> {
    if expected == found {
        Ok(())
    } else {
        Err(ExprError::Type {
            message: format!(
                "{} requires {}, found {}",
                what,
                type_name(expected),
                type_name(found)
            ),
        })
    }
}

/// Evaluate an expression against a scope.
///
/// Both operands of every binary operator are evaluated before the
/// operator applies, so an undefined identifier is an error no matter
/// where it sits in the expression.
pub fn eval(expr: &Expr, scope: &dyn EvalScope) -> Result<Scalar, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .lookup(name)
            .ok_or_else(|| ExprError::Undefined { name: name.clone() }),
        Expr::Call { func, key } => eval_call(*func, key.as_deref(), scope),
        Expr::Unary { op, operand } => {
            let value = eval(operand, scope)?;
            match (op, value) {
                (UnaryOp::Not, Scalar::Bool(b)) => Ok(Scalar::Bool(!b)),
                (UnaryOp::Neg, Scalar::Num(n)) => Ok(Scalar::Num(-n)),
                (UnaryOp::Not, other) => Err(ExprError::Type {
                    message: format!("not requires bool, found {}", type_name(scalar_type(&other))),
                }),
                (UnaryOp::Neg, other) => Err(ExprError::Type {
                    message: format!("- requires num, found {}", type_name(scalar_type(&other))),
                }),
            }
        }
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, scope)?;
            let rhs = eval(right, scope)?;
            eval_binary(*op, lhs, rhs)
        }
    }
}

fn eval_call(func: Func, key: Option<&str>, scope: &dyn EvalScope) -> Result<Scalar, ExprError> {
    match func {
        Func::Now => Ok(Scalar::Num(scope.now())),
        Func::Status => {
            let key = key.expect("parser guarantees a key");
            scope.status(key).ok_or_else(|| ExprError::Undefined {
                name: key.to_string(),
            })
        }
        Func::Elapsed => {
            let key = key.expect("parser guarantees a key");
            scope
                .elapsed(key)
                .map(Scalar::Num)
                .ok_or_else(|| ExprError::Undefined {
                    name: key.to_string(),
                })
        }
        Func::Count => Ok(Scalar::Num(scope.count(key.expect("parser guarantees a key")))),
        Func::Has => Ok(Scalar::Bool(scope.has(key.expect("parser guarantees a key")))),
    }
}

fn eval_binary(op: BinOp, lhs: Scalar, rhs: Scalar) -> Result<Scalar, ExprError> {
    match op {
        BinOp::And | BinOp::Or => match (lhs, rhs) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Ok(Scalar::Bool(if op == BinOp::And {
                a && b
            } else {
                a || b
            })),
            (a, b) => Err(ExprError::Type {
                message: format!(
                    "and/or require bool operands, found {} and {}",
                    type_name(scalar_type(&a)),
                    type_name(scalar_type(&b))
                ),
            }),
        },
        BinOp::Eq | BinOp::Ne => {
            if scalar_type(&lhs) != scalar_type(&rhs) {
                return Err(ExprError::Type {
                    message: format!(
                        "cannot compare {} with {}",
                        type_name(scalar_type(&lhs)),
                        type_name(scalar_type(&rhs))
                    ),
                });
            }
            let equal = lhs == rhs;
            Ok(Scalar::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => match (lhs, rhs) {
            (Scalar::Num(a), Scalar::Num(b)) => Ok(Scalar::Bool(match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                _ => a >= b,
            })),
            (a, b) => Err(ExprError::Type {
                message: format!(
                    "comparison requires num operands, found {} and {}",
                    type_name(scalar_type(&a)),
                    type_name(scalar_type(&b))
                ),
            }),
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => match (lhs, rhs) {
            (Scalar::Num(a), Scalar::Num(b)) => {
                if op == BinOp::Div && b == 0.0 {
                    return Err(ExprError::DivByZero);
                }
                let result = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    _ => a / b,
                };
                if !result.is_finite() {
                    return Err(ExprError::Overflow);
                }
                Ok(Scalar::Num(result))
            }
            (a, b) => Err(ExprError::Type {
                message: format!(
                    "arithmetic requires num operands, found {} and {}",
                    type_name(scalar_type(&a)),
                    type_name(scalar_type(&b))
                ),
            }),
        },
    }
}

//! Guard evaluation
//!
//! Guards run in declared order at their pre/post point; the first
//! failing guard decides the outcome and carries its `on_fail` action.
//! An expression error inside a guard condition counts as that guard
//! failing, never as a crash.

use crate::error::{EngineError, EngineResult};
use crate::expr::{self, EvalScope};
use crate::model::{GuardAction, GuardWhen, Scalar};
use crate::program::Program;

/// Result of one guard pass.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// Every applicable guard held
    Pass,
    /// The first failing guard and its configured action
    Fail {
        /// Failing guard id
        guard: String,
        /// Action to take
        action: GuardAction,
        /// What failed: `GuardFail` or the underlying expression error
        error: EngineError,
    },
}

/// Evaluate the guards of `guard_ids` bound to `when`, in declared
/// order, against `scope`.
///
/// # Errors
///
/// `Ref` when a guard or its condition is missing from the program;
/// the validator rules this out for loaded models.
pub fn check_guards(
    program: &Program,
    when: GuardWhen,
    guard_ids: &[String],
    scope: &dyn EvalScope,
) -> EngineResult<GuardOutcome> {
    for guard_id in guard_ids {
        let guard = program
            .config
            .guards
            .get(guard_id)
            .ok_or_else(|| EngineError::Ref {
                entity: "guard",
                id: guard_id.clone(),
            })?;
        if guard.when != when {
            continue;
        }
        let compiled = program
            .conditions
            .get(&guard.condition)
            .ok_or_else(|| EngineError::Ref {
                entity: "condition",
                id: guard.condition.clone(),
            })?;

        match expr::eval(compiled, scope) {
            Ok(Scalar::Bool(true)) => continue,
            Ok(Scalar::Bool(false)) => {
                tracing::debug!(guard = %guard_id, "guard condition is false");
                return Ok(GuardOutcome::Fail {
                    guard: guard_id.clone(),
                    action: guard.on_fail.clone(),
                    error: EngineError::GuardFail {
                        guard: guard_id.clone(),
                    },
                });
            }
            Ok(_) => {
                // The validator requires boolean conditions; a non-bool
                // here means the scope produced a surprising value.
                return Ok(GuardOutcome::Fail {
                    guard: guard_id.clone(),
                    action: guard.on_fail.clone(),
                    error: EngineError::GuardFail {
                        guard: guard_id.clone(),
                    },
                });
            }
            Err(expr_error) => {
                tracing::debug!(guard = %guard_id, error = %expr_error, "guard expression errored");
                return Ok(GuardOutcome::Fail {
                    guard: guard_id.clone(),
                    action: guard.on_fail.clone(),
                    error: EngineError::Expr(expr_error),
                });
            }
        }
    }
    Ok(GuardOutcome::Pass)
}

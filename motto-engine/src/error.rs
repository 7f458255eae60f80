//! Error types for the orchestration core
//!
//! The runtime failure taxonomy is closed: every failure a caller can
//! observe on a `SequenceResult` or an audit record is one of the
//! variants of [`EngineError`]. Configuration defects found before
//! execution are reported as a list of [`ConfigError`] values, never one
//! at a time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::ExprError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Classification of a configuration defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorKind {
    /// TOML syntax or type error
    Syntax,
    /// Unknown or unsupported `version`
    Version,
    /// Duplicate id within one section
    DuplicateId,
    /// Unrecognized key (error only in strict mode)
    UnknownKey,
    /// Reference to an id that does not exist
    UnknownRef,
    /// `if`/`else`/`endif` blocks do not balance
    UnbalancedBlock,
    /// Sequence or template reference cycle
    Cycle,
    /// Parallel branches share a mutex, or semaphore demand exceeds permits
    ResourceConflict,
    /// Command invocation misses a declared, undefaulted parameter
    MissingParam,
    /// Expression failed to type-check to its required type
    TypeError,
    /// Value outside its documented range (attempts, permits, timeouts)
    Range,
}

/// A single configuration defect with the path that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigError {
    /// Dotted path into the document (`sequences.startup.steps[3]`)
    pub path: String,
    /// Defect classification
    pub kind: ConfigErrorKind,
    /// Human-readable description
    pub message: String,
}

impl ConfigError {
    /// Build a defect record for the given path.
    pub fn new(path: impl Into<String>, kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}: {}", self.path, self.kind, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Runtime failure taxonomy for sequence execution.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineError {
    /// Parse/validate failure; no execution took place
    #[error("configuration rejected with {} defect(s)", .0.len())]
    Config(Vec<ConfigError>),

    /// Unknown id at dispatch (the validator should have caught this)
    #[error("unknown {entity} id '{id}'")]
    Ref {
        /// Entity section the id belongs to
        entity: &'static str,
        /// The missing id
        id: String,
    },

    /// Required command/template parameter unresolved at dispatch
    #[error("parameter '{param}' unresolved for command '{command}'")]
    ParamMissing {
        /// Command being rendered
        command: String,
        /// The unresolved parameter
        param: String,
    },

    /// Expression evaluation error (type, undefined id, div/0, overflow)
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// A guard condition evaluated to false
    #[error("guard '{guard}' failed")]
    GuardFail {
        /// The failing guard id
        guard: String,
    },

    /// Per-attempt, per-step, or per-sequence time cap exceeded
    #[error("timed out after {elapsed_ms} ms")]
    Timeout {
        /// Elapsed milliseconds when the cap was hit
        elapsed_ms: u64,
    },

    /// Transport send/receive failed (including device ERR responses)
    #[error("transport error: {0}")]
    Transport(String),

    /// Resource acquire deadline exceeded
    #[error("acquire of resource '{resource}' timed out")]
    ResourceTimeout {
        /// The contended resource id
        resource: String,
    },

    /// Cooperative cancellation observed
    #[error("cancelled")]
    Cancelled,

    /// Event dropped due to a full per-handler queue
    #[error("handler '{handler}' queue overflow")]
    HandlerOverflow {
        /// Handler whose queue overflowed
        handler: String,
    },
}

impl EngineError {
    /// Whether the policy engine may spend retry budget on this failure.
    ///
    /// Guard failures are routed through their `on_fail` action instead,
    /// and cancellation is always terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. }
                | EngineError::Transport(_)
                | EngineError::ResourceTimeout { .. }
                | EngineError::ParamMissing { .. }
        )
    }

    /// Stable lowercase tag for audit records and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Ref { .. } => "ref",
            EngineError::ParamMissing { .. } => "param_missing",
            EngineError::Expr(_) => "expr",
            EngineError::GuardFail { .. } => "guard_fail",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Transport(_) => "transport",
            EngineError::ResourceTimeout { .. } => "resource_timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::HandlerOverflow { .. } => "handler_overflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(EngineError::Transport("ERR 3".into()).is_retryable());
        assert!(EngineError::ResourceTimeout { resource: "pump".into() }.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::GuardFail { guard: "g1".into() }.is_retryable());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::new(
            "sequences.startup.steps[2]",
            ConfigErrorKind::UnknownRef,
            "command 'pong' does not exist",
        );
        let text = err.to_string();
        assert!(text.contains("sequences.startup.steps[2]"));
        assert!(text.contains("pong"));
    }
}

//! Execution context and variable scoping
//!
//! One [`ExecutionContext`] is owned by a single in-flight sequence
//! invocation. Parallel branches and handler actions get children: shared
//! read-only scope data plus a private cancellation sub-token, so
//! cancelling a parent cancels every descendant.
//!
//! Variable resolution is a scope chain, innermost first: step-local
//! `let` → call-site vars → profile overlay → global vars.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::expr::EvalScope;
use crate::model::Scalar;

/// Opaque identifier threaded through audit records for one `execute`
/// call and its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared mutable status/counter store read by expressions.
///
/// Updated by transport notifications, `set_status`, and event
/// publication counters. Critical sections are map operations only.
#[derive(Default)]
pub struct StatusBoard {
    statuses: RwLock<BTreeMap<String, Scalar>>,
    counts: RwLock<BTreeMap<String, u64>>,
}

impl StatusBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a status key.
    pub fn set_status(&self, key: impl Into<String>, value: impl Into<Scalar>) {
        self.statuses.write().insert(key.into(), value.into());
    }

    /// Read a status key.
    pub fn status(&self, key: &str) -> Option<Scalar> {
        self.statuses.read().get(key).cloned()
    }

    /// Increment an emission counter.
    pub fn bump_count(&self, key: &str) {
        *self.counts.write().entry(key.to_string()).or_insert(0) += 1;
    }

    /// Read an emission counter; unknown keys count 0.
    pub fn count(&self, key: &str) -> u64 {
        self.counts.read().get(key).copied().unwrap_or(0)
    }
}

/// Per-invocation execution state.
///
/// Cloning is cheap: scope layers and shared stores are `Arc`s. Children
/// share everything except the cancellation token and depth.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Correlation id for audit records
    pub correlation_id: CorrelationId,
    /// Active profile id, if any
    pub profile: Option<String>,
    /// Cancellation token for this invocation
    pub cancel: CancellationToken,
    /// Monotonic start instant
    pub started: Instant,
    /// Nesting depth (root = 0), bounded by the executor
    pub depth: u32,
    /// Scope chain, outermost first
    scopes: Vec<Arc<BTreeMap<String, Scalar>>>,
    /// Named time markers for `elapsed("…")`
    markers: Arc<RwLock<BTreeMap<String, Instant>>>,
    /// Shared status board
    pub board: Arc<StatusBoard>,
    /// Shared audit sink
    pub audit: Arc<AuditLog>,
}

impl ExecutionContext {
    /// Build a root context from scope layers (outermost first).
    pub fn new(
        profile: Option<String>,
        scopes: Vec<Arc<BTreeMap<String, Scalar>>>,
        board: Arc<StatusBoard>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let started = Instant::now();
        let markers = Arc::new(RwLock::new(BTreeMap::new()));
        markers.write().insert("start".to_string(), started);
        Self {
            correlation_id: CorrelationId::new(),
            profile,
            cancel: CancellationToken::new(),
            started,
            depth: 0,
            scopes,
            markers,
            board,
            audit,
        }
    }

    /// Child context for a parallel branch or nested handler execution:
    /// shared read-only data, private cancellation sub-token, depth + 1.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child.depth = self.depth + 1;
        child
    }

    /// Child context with additional call-site variables layered on.
    pub fn child_with_vars(&self, vars: BTreeMap<String, Scalar>) -> Self {
        let mut child = self.child();
        if !vars.is_empty() {
            child.scopes.push(Arc::new(vars));
        }
        child
    }

    /// Set a named time marker.
    pub fn mark(&self, name: impl Into<String>) {
        self.markers.write().insert(name.into(), Instant::now());
    }

    /// Resolve a variable through the scope chain, innermost first.
    pub fn var(&self, name: &str) -> Option<Scalar> {
        self.scopes.iter().rev().find_map(|layer| layer.get(name).cloned())
    }

    /// Milliseconds since this context started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Expression scope over this context, with optional step-local
    /// `let` bindings and an optional payload overlay (filters).
    pub fn eval_scope<'a>(
        &'a self,
        lets: Option<&'a BTreeMap<String, Scalar>>,
        payload: Option<&'a BTreeMap<String, Scalar>>,
    ) -> ContextScope<'a> {
        ContextScope {
            ctx: self,
            lets,
            payload,
        }
    }
}

/// Read-only expression view of an [`ExecutionContext`].
pub struct ContextScope<'a> {
    ctx: &'a ExecutionContext,
    lets: Option<&'a BTreeMap<String, Scalar>>,
    payload: Option<&'a BTreeMap<String, Scalar>>,
}

impl EvalScope for ContextScope<'_> {
    fn lookup(&self, name: &str) -> Option<Scalar> {
        if let Some(payload) = self.payload {
            if let Some(value) = payload.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(lets) = self.lets {
            if let Some(value) = lets.get(name) {
                return Some(value.clone());
            }
        }
        self.ctx.var(name)
    }

    fn status(&self, key: &str) -> Option<Scalar> {
        self.ctx.board.status(key)
    }

    fn count(&self, key: &str) -> f64 {
        self.ctx.board.count(key) as f64
    }

    fn elapsed(&self, marker: &str) -> Option<f64> {
        self.ctx
            .markers
            .read()
            .get(marker)
            .map(|instant| instant.elapsed().as_secs_f64())
    }

    fn now(&self) -> f64 {
        self.ctx.started.elapsed().as_secs_f64()
    }
}

//! Event bus
//!
//! Publications come from three places: explicit `publish` calls,
//! transport notifications, and periodic timer events. Publishing never
//! blocks: matching, debouncing, and queueing happen under one short
//! lock, then a single dispatcher task drains the queues and runs one
//! handler at a time, which preserves the (priority desc, id asc)
//! dispatch order per event.
//!
//! Every handler owns a bounded queue; overflow drops the oldest queued
//! dispatch for that handler and bumps a counter. Handler failures are
//! audited and counted, never surfaced to the publisher.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::context::StatusBoard;
use crate::error::EngineResult;
use crate::expr::{self, EvalScope};
use crate::model::Scalar;
use crate::program::Program;

/// Executes one handler's action list; implemented by the orchestrator.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    /// Run every action of `handler_id` for one dispatch of `event_id`.
    async fn run_handler(
        &self,
        handler_id: &str,
        event_id: &str,
        payload: &BTreeMap<String, Scalar>,
    ) -> EngineResult<()>;
}

/// Queue sizes and drop counters for one handler, for status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerQueueStatus {
    /// Handler id
    pub handler: String,
    /// Currently queued dispatches
    pub queued: usize,
    /// Dispatches dropped by overflow since load
    pub dropped: u64,
    /// Handler action failures since load
    pub errors: u64,
}

struct QueuedDispatch {
    seq: u64,
    event: String,
    payload: BTreeMap<String, Scalar>,
}

#[derive(Default)]
struct BusState {
    handler_queues: HashMap<String, VecDeque<QueuedDispatch>>,
    order: VecDeque<(String, u64)>,
    dropped: HashMap<String, u64>,
    errors: HashMap<String, u64>,
    last_dispatch: HashMap<String, Instant>,
    next_seq: u64,
}

/// The event bus for one loaded program.
pub struct EventBus {
    program: Arc<Program>,
    board: Arc<StatusBoard>,
    audit: Arc<AuditLog>,
    queue_capacity: usize,
    started: Instant,
    state: Mutex<BusState>,
    notify: Notify,
}

impl EventBus {
    /// Create a bus over a compiled program.
    pub fn new(
        program: Arc<Program>,
        board: Arc<StatusBoard>,
        audit: Arc<AuditLog>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            program,
            board,
            audit,
            queue_capacity: queue_capacity.max(1),
            started: Instant::now(),
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
        }
    }

    /// Publish directly to a named event. The event's filter still runs;
    /// a false filter suppresses the publication.
    pub fn publish(&self, event_id: &str, payload: BTreeMap<String, Scalar>) {
        if !self.program.config.events.contains_key(event_id) {
            tracing::warn!(event = event_id, "publish to unknown event dropped");
            return;
        }
        if !self.filter_passes(event_id, &payload) {
            return;
        }
        self.enqueue_matched(event_id, payload);
    }

    /// Publish an emission by source tag (`"step"`, `"transport"`,
    /// `"timer"`); every event declared with that source and a passing
    /// filter fires.
    pub fn publish_from_source(&self, source: &str, payload: BTreeMap<String, Scalar>) {
        let matched: Vec<String> = self
            .program
            .config
            .events
            .iter()
            .filter(|(_, event)| event.source == source)
            .map(|(id, _)| id.clone())
            .collect();
        for event_id in matched {
            if self.filter_passes(&event_id, &payload) {
                self.enqueue_matched(&event_id, payload.clone());
            }
        }
    }

    fn filter_passes(&self, event_id: &str, payload: &BTreeMap<String, Scalar>) -> bool {
        let Some(filter) = self.program.filters.get(event_id) else {
            return false;
        };
        let scope = FilterScope {
            payload,
            board: &self.board,
            started: self.started,
        };
        match expr::eval(filter, &scope) {
            Ok(Scalar::Bool(value)) => value,
            Ok(_) => false,
            Err(error) => {
                tracing::warn!(event = event_id, %error, "event filter errored; treated as no match");
                false
            }
        }
    }

    fn enqueue_matched(&self, event_id: &str, payload: BTreeMap<String, Scalar>) {
        self.board.bump_count(event_id);

        let handlers = match self.program.handler_order.get(event_id) {
            Some(order) => order.clone(),
            None => return,
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        for handler_id in handlers {
            let handler = &self.program.config.handlers[&handler_id];

            if handler.debounce_ms > 0 {
                if let Some(last) = state.last_dispatch.get(&handler_id) {
                    if now.duration_since(*last).as_millis() < handler.debounce_ms as u128 {
                        tracing::debug!(handler = %handler_id, "dispatch debounced");
                        self.audit.record(
                            "-",
                            "handler.debounced",
                            serde_json::json!({ "handler": handler_id, "event": event_id }),
                        );
                        continue;
                    }
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let queue = state.handler_queues.entry(handler_id.clone()).or_default();
            if queue.len() >= self.queue_capacity {
                queue.pop_front();
                *state.dropped.entry(handler_id.clone()).or_insert(0) += 1;
                tracing::warn!(handler = %handler_id, "handler queue overflow, oldest dispatch dropped");
                self.audit.record(
                    "-",
                    "handler.overflow",
                    serde_json::json!({ "handler": handler_id, "event": event_id }),
                );
            }
            state
                .handler_queues
                .get_mut(&handler_id)
                .expect("entry just touched")
                .push_back(QueuedDispatch {
                    seq,
                    event: event_id.to_string(),
                    payload: payload.clone(),
                });
            state.order.push_back((handler_id, seq));
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Drive the single-threaded dispatch loop until `shutdown` fires.
    ///
    /// Handlers run one at a time; no bus lock is held across a dispatch.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        runner: Arc<dyn HandlerRunner>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let mut found = None;
                while let Some((handler_id, seq)) = state.order.pop_front() {
                    let dispatch = match state.handler_queues.get_mut(&handler_id) {
                        Some(queue) if queue.front().map(|d| d.seq) == Some(seq) => {
                            queue.pop_front()
                        }
                        // Stale ticket: its dispatch was dropped by
                        // overflow.
                        _ => None,
                    };
                    if let Some(dispatch) = dispatch {
                        state.last_dispatch.insert(handler_id.clone(), Instant::now());
                        found = Some((handler_id, dispatch));
                        break;
                    }
                }
                found
            };

            match next {
                Some((handler_id, dispatch)) => {
                    if let Err(error) = runner
                        .run_handler(&handler_id, &dispatch.event, &dispatch.payload)
                        .await
                    {
                        tracing::warn!(handler = %handler_id, %error, "handler actions failed");
                        self.audit.record(
                            "-",
                            "handler.failed",
                            serde_json::json!({
                                "handler": handler_id,
                                "event": dispatch.event,
                                "error": error.tag(),
                            }),
                        );
                        let mut state = self.state.lock();
                        *state.errors.entry(handler_id).or_insert(0) += 1;
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Queue/drop/error counters per handler.
    pub fn queue_status(&self) -> Vec<HandlerQueueStatus> {
        let state = self.state.lock();
        let mut handlers: Vec<&String> = self.program.config.handlers.keys().collect();
        handlers.sort();
        handlers
            .into_iter()
            .map(|handler| HandlerQueueStatus {
                handler: handler.clone(),
                queued: state.handler_queues.get(handler).map_or(0, |q| q.len()),
                dropped: state.dropped.get(handler).copied().unwrap_or(0),
                errors: state.errors.get(handler).copied().unwrap_or(0),
            })
            .collect()
    }
}

struct FilterScope<'a> {
    payload: &'a BTreeMap<String, Scalar>,
    board: &'a StatusBoard,
    started: Instant,
}

impl EvalScope for FilterScope<'_> {
    fn lookup(&self, name: &str) -> Option<Scalar> {
        self.payload.get(name).cloned()
    }

    fn status(&self, key: &str) -> Option<Scalar> {
        self.board.status(key)
    }

    fn count(&self, key: &str) -> f64 {
        self.board.count(key) as f64
    }

    fn elapsed(&self, _marker: &str) -> Option<f64> {
        None
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn has(&self, key: &str) -> bool {
        self.payload.contains_key(key) || self.board.status(key).is_some()
    }
}

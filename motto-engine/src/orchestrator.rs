//! Orchestrator facade
//!
//! The public face of the engine. Owns the loaded model and every
//! runtime store derived from it (resource registry, event bus, policy
//! engine), the transport serializer, the status board, and the audit
//! ring. `load` atomically replaces the model; in-flight sequences keep
//! executing against the model they started with because everything
//! model-scoped hangs off one `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::context::{ExecutionContext, StatusBoard};
use crate::error::{ConfigError, ConfigErrorKind, EngineError, EngineResult};
use crate::events::{EventBus, HandlerQueueStatus, HandlerRunner};
use crate::executor::{SequenceExecutor, SequenceResult};
use crate::model::{HandlerAction, Scalar};
use crate::parser;
use crate::policy::PolicyEngine;
use crate::program::Program;
use crate::resource::{ResourceRegistry, ResourceStatus};
use crate::transport::{Transport, TransportLink};
use motto_config::MottoSettings;

/// One currently running sequence, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningSequence {
    /// Correlation id of the invocation
    pub correlation_id: String,
    /// Sequence id
    pub sequence: String,
    /// Milliseconds since the invocation started
    pub elapsed_ms: u64,
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Sequences currently in flight
    pub running: Vec<RunningSequence>,
    /// Per-handler queue sizes and counters
    pub handlers: Vec<HandlerQueueStatus>,
    /// Resources with holders and queue lengths
    pub resources: Vec<ResourceStatus>,
}

struct RunningEntry {
    sequence: String,
    cancel: CancellationToken,
    started: Instant,
}

/// Everything derived from one loaded model.
struct ModelRuntime {
    program: Arc<Program>,
    resources: Arc<ResourceRegistry>,
    bus: Arc<EventBus>,
    executor: SequenceExecutor,
    /// Fires when this model is replaced; stops its dispatcher/timers
    lifetime: CancellationToken,
}

/// The orchestration API: load a configuration, execute sequences,
/// publish events, query status.
pub struct Orchestrator {
    settings: MottoSettings,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    board: Arc<StatusBoard>,
    transport: TransportLink,
    runtime: RwLock<Option<Arc<ModelRuntime>>>,
    running: Arc<Mutex<HashMap<String, RunningEntry>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator over a transport and clock.
    ///
    /// Spawns the transport serializer task and, when the transport
    /// surfaces out-of-band events, a pump that republishes them with
    /// source tag `"transport"` and mirrors their payloads onto the
    /// status board.
    pub fn new(
        settings: MottoSettings,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let audit = Arc::new(AuditLog::default());
        let board = Arc::new(StatusBoard::new());
        let events = transport.take_events();
        let link = TransportLink::spawn(transport);

        let orchestrator = Arc::new(Self {
            settings,
            clock,
            audit,
            board,
            transport: link,
            runtime: RwLock::new(None),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        });

        if let Some(mut events) = events {
            // The pump holds a weak handle and exits once the
            // orchestrator itself is gone.
            let this = Arc::downgrade(&orchestrator);
            let shutdown = orchestrator.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => {
                                let Some(this) = this.upgrade() else { return };
                                this.board.set_status(event.name.clone(), Scalar::Num(1.0));
                                for (key, value) in &event.payload {
                                    this.board.set_status(key.clone(), value.clone());
                                }
                                let mut payload = event.payload;
                                payload.insert("name".to_string(), Scalar::Str(event.name.clone()));
                                this.audit.record(
                                    "-",
                                    "transport.event",
                                    serde_json::json!({ "name": event.name }),
                                );
                                this.publish_from_source("transport", payload);
                            }
                            None => return,
                        },
                        _ = shutdown.cancelled() => return,
                    }
                }
            });
        }

        orchestrator
    }

    /// Parse, validate, and atomically install a configuration.
    ///
    /// Returns unknown-key warnings on success and the full defect list
    /// on failure. In-flight sequences keep the model they started with;
    /// the old model's handler dispatch and timers stop.
    pub fn load(self: &Arc<Self>, config_bytes: &[u8]) -> Result<Vec<ConfigError>, Vec<ConfigError>> {
        let loaded = parser::load(config_bytes, self.settings.loader.strict)?;
        let warnings = loaded.warnings;
        let program = Arc::new(Program::compile(loaded.config)?);

        let lifetime = self.shutdown.child_token();
        let resources = Arc::new(ResourceRegistry::new(
            &program.config.resources,
            Arc::clone(&self.clock),
        ));
        let policies = Arc::new(PolicyEngine::new(
            Duration::from_millis(self.settings.idempotency.ttl_ms),
            Arc::clone(&self.clock),
        ));
        let bus = Arc::new(EventBus::new(
            Arc::clone(&program),
            Arc::clone(&self.board),
            Arc::clone(&self.audit),
            self.settings.events.handler_queue_capacity,
        ));
        let executor = SequenceExecutor::new(
            Arc::clone(&program),
            Arc::clone(&resources),
            policies,
            self.transport.clone(),
            Arc::clone(&bus),
            Arc::clone(&self.clock),
            self.settings.engine.max_nested_depth,
            self.settings.engine.default_wall_clock_cap_ms,
            self.settings.transport.default_deadline_ms,
            self.settings.guards.run_post_guards_on_timeout,
        );

        let runner = Arc::new(ActionRunner {
            program: Arc::clone(&program),
            executor: executor.clone(),
            bus: Arc::clone(&bus),
            board: Arc::clone(&self.board),
            audit: Arc::clone(&self.audit),
            running: Arc::clone(&self.running),
            lifetime: lifetime.clone(),
        });
        tokio::spawn(Arc::clone(&bus).run_dispatcher(runner, lifetime.clone()));

        // Periodic timer events declared in the model.
        for (event_id, event) in &program.config.events {
            let Some(every_ms) = event.every_ms else { continue };
            let bus = Arc::clone(&bus);
            let clock = Arc::clone(&self.clock);
            let stop = lifetime.clone();
            let event_id = event_id.clone();
            tokio::spawn(async move {
                let period = Duration::from_millis(every_ms.max(1));
                loop {
                    if clock.sleep(period, &stop).await.is_err() {
                        return;
                    }
                    bus.publish(&event_id, BTreeMap::new());
                }
            });
        }

        let runtime = Arc::new(ModelRuntime {
            program,
            resources,
            bus,
            executor,
            lifetime,
        });

        let previous = self.runtime.write().replace(runtime);
        if let Some(previous) = previous {
            previous.lifetime.cancel();
        }

        tracing::info!("configuration loaded");
        Ok(warnings)
    }

    fn current_runtime(&self) -> EngineResult<Arc<ModelRuntime>> {
        self.runtime.read().clone().ok_or_else(|| {
            EngineError::Config(vec![ConfigError::new(
                "<runtime>",
                ConfigErrorKind::Syntax,
                "no configuration loaded",
            )])
        })
    }

    fn build_context(
        &self,
        runtime: &ModelRuntime,
        vars: BTreeMap<String, Scalar>,
        profile: Option<&str>,
    ) -> EngineResult<ExecutionContext> {
        let config = &runtime.program.config;
        let mut scopes = vec![Arc::new(config.vars.clone())];
        if let Some(profile_id) = profile {
            let profile = config.profiles.get(profile_id).ok_or_else(|| EngineError::Ref {
                entity: "profile",
                id: profile_id.to_string(),
            })?;
            scopes.push(Arc::new(profile.vars.clone()));
        }
        if !vars.is_empty() {
            scopes.push(Arc::new(vars));
        }
        let ctx = ExecutionContext::new(
            profile.map(|p| p.to_string()),
            scopes,
            Arc::clone(&self.board),
            Arc::clone(&self.audit),
        );
        Ok(ctx)
    }

    /// Execute a sequence to completion.
    ///
    /// # Errors
    ///
    /// Only pre-flight failures (no model, unknown profile) surface as
    /// `Err`; everything that happens during execution is reported
    /// inside the returned [`SequenceResult`].
    pub async fn execute(
        self: &Arc<Self>,
        sequence_id: &str,
        vars: BTreeMap<String, Scalar>,
        profile: Option<&str>,
    ) -> EngineResult<SequenceResult> {
        let handle = self.execute_async(sequence_id, vars, profile)?;
        Ok(handle.wait().await)
    }

    /// Start a sequence and return a handle with `cancel`/`wait`.
    pub fn execute_async(
        self: &Arc<Self>,
        sequence_id: &str,
        vars: BTreeMap<String, Scalar>,
        profile: Option<&str>,
    ) -> EngineResult<ExecutionHandle> {
        let runtime = self.current_runtime()?;
        let ctx = self.build_context(&runtime, vars, profile)?;
        let correlation_id = ctx.correlation_id.to_string();
        let cancel = ctx.cancel.clone();

        self.running.lock().insert(
            correlation_id.clone(),
            RunningEntry {
                sequence: sequence_id.to_string(),
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );

        let future = runtime.executor.execute(sequence_id.to_string(), ctx);
        let running = Arc::clone(&self.running);
        let correlation_for_task = correlation_id.clone();
        let join = tokio::spawn(async move {
            let result = future.await;
            running.lock().remove(&correlation_for_task);
            result
        });

        Ok(ExecutionHandle {
            correlation_id,
            sequence: sequence_id.to_string(),
            cancel,
            join,
        })
    }

    /// Fire-and-forget publication to a named event.
    pub fn publish(&self, event_id: &str, payload: BTreeMap<String, Scalar>) {
        match self.runtime.read().as_ref() {
            Some(runtime) => runtime.bus.publish(event_id, payload),
            None => tracing::warn!(event = event_id, "publish with no configuration loaded"),
        }
    }

    fn publish_from_source(&self, source: &str, payload: BTreeMap<String, Scalar>) {
        if let Some(runtime) = self.runtime.read().as_ref() {
            runtime.bus.publish_from_source(source, payload);
        }
    }

    /// Cancel one running sequence by correlation id.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let running = self.running.lock();
        match running.get(correlation_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running sequence.
    pub fn cancel_all(&self) {
        for entry in self.running.lock().values() {
            entry.cancel.cancel();
        }
    }

    /// Set a status-board key (transport glue and hosts).
    pub fn set_status(&self, key: impl Into<String>, value: impl Into<Scalar>) {
        self.board.set_status(key, value);
    }

    /// Running sequences, handler queues, and held resources.
    pub fn status(&self) -> Snapshot {
        let running = self
            .running
            .lock()
            .iter()
            .map(|(correlation_id, entry)| RunningSequence {
                correlation_id: correlation_id.clone(),
                sequence: entry.sequence.clone(),
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        let (handlers, resources) = match self.runtime.read().as_ref() {
            Some(runtime) => (runtime.bus.queue_status(), runtime.resources.snapshot()),
            None => (Vec::new(), Vec::new()),
        };
        Snapshot {
            running,
            handlers,
            resources,
        }
    }

    /// Snapshot of the audit ring, oldest first.
    pub fn audit_snapshot(&self) -> Vec<AuditRecord> {
        self.audit.snapshot()
    }

    /// The audit sink itself, for hosts that tail it.
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    /// Canonical TOML of the loaded configuration.
    pub fn canonical(&self) -> EngineResult<String> {
        let runtime = self.current_runtime()?;
        parser::canonical(&runtime.program.config)
            .map_err(|e| EngineError::Config(vec![e]))
    }

    /// Stop background tasks (dispatcher, timers, pumps) and cancel
    /// running sequences.
    pub fn shutdown(&self) {
        self.cancel_all();
        self.shutdown.cancel();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to an asynchronous sequence execution.
pub struct ExecutionHandle {
    /// Correlation id of the invocation
    pub correlation_id: String,
    /// Sequence id
    pub sequence: String,
    cancel: CancellationToken,
    join: JoinHandle<SequenceResult>,
}

impl ExecutionHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the execution reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Await the result.
    pub async fn wait(self) -> SequenceResult {
        match self.join.await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(%join_error, "execution task failed");
                SequenceResult {
                    sequence: self.sequence,
                    correlation_id: self.correlation_id,
                    status: crate::executor::SequenceStatus::Cancelled,
                    steps: Vec::new(),
                    completed: 0,
                    total: 0,
                    elapsed_ms: 0,
                    error: Some(EngineError::Cancelled),
                }
            }
        }
    }
}

/// Runs handler action lists for the event dispatcher.
struct ActionRunner {
    program: Arc<Program>,
    executor: SequenceExecutor,
    bus: Arc<EventBus>,
    board: Arc<StatusBoard>,
    audit: Arc<AuditLog>,
    running: Arc<Mutex<HashMap<String, RunningEntry>>>,
    lifetime: CancellationToken,
}

#[async_trait::async_trait]
impl HandlerRunner for ActionRunner {
    async fn run_handler(
        &self,
        handler_id: &str,
        event_id: &str,
        payload: &BTreeMap<String, Scalar>,
    ) -> EngineResult<()> {
        let handler = self
            .program
            .config
            .handlers
            .get(handler_id)
            .ok_or_else(|| EngineError::Ref {
                entity: "handler",
                id: handler_id.to_string(),
            })?;

        for action in &handler.actions {
            match action {
                HandlerAction::Run(sequence_id) => {
                    // Handler actions are nested executions with their
                    // own sub-token under the model lifetime.
                    let scopes = vec![
                        Arc::new(self.program.config.vars.clone()),
                        Arc::new(payload.clone()),
                    ];
                    let mut ctx = ExecutionContext::new(
                        None,
                        scopes,
                        Arc::clone(&self.board),
                        Arc::clone(&self.audit),
                    );
                    ctx.cancel = self.lifetime.child_token();
                    self.audit.record(
                        ctx.correlation_id.to_string(),
                        "handler.dispatched",
                        serde_json::json!({
                            "handler": handler_id,
                            "event": event_id,
                            "sequence": sequence_id,
                        }),
                    );
                    let result = self.executor.execute(sequence_id.clone(), ctx).await;
                    if let Some(error) = result.error {
                        return Err(error);
                    }
                }
                HandlerAction::CancelAll => {
                    tracing::warn!(handler = handler_id, "handler requested cancel-all");
                    for entry in self.running.lock().values() {
                        entry.cancel.cancel();
                    }
                }
                HandlerAction::Publish(event) => {
                    self.bus.publish(event, payload.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;
    use crate::clock::SysClock;

    fn orchestrator_with(transport: Arc<ScriptedTransport>) -> Arc<Orchestrator> {
        Orchestrator::new(
            MottoSettings::default(),
            transport as Arc<dyn Transport>,
            Arc::new(SysClock),
        )
    }

    const BASIC: &str = r#"
version = "1.1"

[commands.ping]
line = "PING"

[sequences.s]
steps = [ { command = "ping" } ]
"#;

    #[tokio::test]
    async fn execute_without_model_is_a_config_error() {
        let orchestrator = orchestrator_with(Arc::new(ScriptedTransport::new()));
        let result = orchestrator.execute("s", BTreeMap::new(), None).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn load_then_execute_round_trip() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = orchestrator_with(Arc::clone(&transport));
        orchestrator.load(BASIC.as_bytes()).expect("loads");

        let result = orchestrator
            .execute("s", BTreeMap::new(), None)
            .await
            .expect("runs");
        assert_eq!(result.status, crate::executor::SequenceStatus::Ok);
        assert_eq!(result.completed, 1);
        assert_eq!(result.total, 1);
        assert_eq!(transport.sent_lines(), vec!["PING".to_string()]);
    }

    #[tokio::test]
    async fn unknown_profile_is_a_ref_error() {
        let orchestrator = orchestrator_with(Arc::new(ScriptedTransport::new()));
        orchestrator.load(BASIC.as_bytes()).expect("loads");
        let result = orchestrator
            .execute("s", BTreeMap::new(), Some("ghost"))
            .await;
        assert!(matches!(result, Err(EngineError::Ref { entity: "profile", .. })));
    }

    #[tokio::test]
    async fn status_reports_running_sequences() {
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = orchestrator_with(Arc::clone(&transport));
        orchestrator
            .load(
                br#"
version = "1.1"

[sequences.slow]
steps = [ { wait = 5.0 } ]
"#,
            )
            .expect("loads");

        let handle = orchestrator
            .execute_async("slow", BTreeMap::new(), None)
            .expect("starts");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = orchestrator.status();
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.running[0].sequence, "slow");

        handle.cancel();
        let result = handle.wait().await;
        assert_eq!(result.status, crate::executor::SequenceStatus::Cancelled);
        assert!(orchestrator.status().running.is_empty());
    }

    #[tokio::test]
    async fn reload_replaces_the_model() {
        let orchestrator = orchestrator_with(Arc::new(ScriptedTransport::new()));
        orchestrator.load(BASIC.as_bytes()).expect("loads");
        let replacement = BASIC.replace("PING", "PING2");
        orchestrator.load(replacement.as_bytes()).expect("reloads");
        let canonical = orchestrator.canonical().expect("canonical");
        assert!(canonical.contains("PING2"));
    }
}

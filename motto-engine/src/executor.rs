//! Sequence executor
//!
//! Walks a validated sequence step by step: template rendering, pre
//! guards, resource acquisition, the policy-wrapped transport attempt,
//! post guards, release, step events. One attempt budget per step is
//! shared by every failure kind, so `max_attempts` is never exceeded no
//! matter how a step fails.
//!
//! Cancellation is cooperative: it is checked at every step boundary and
//! at every suspension point (transport attempt, resource acquire, wait,
//! backoff). Resource grants release on drop, so cancellation and panics
//! return what they held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::clock::Clock;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::expr;
use crate::guard::{self, GuardOutcome};
use crate::model::{
    Command, GuardAction, GuardWhen, Policy, Scalar, Sequence, Step, TRANSPORT_RESOURCE,
};
use crate::policy::{AttemptOutput, PolicyEngine};
use crate::program::Program;
use crate::resource::{ResourceGrant, ResourceRegistry};
use crate::template;
use crate::transport::{ResponseStatus, TransportFault, TransportLink};

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Succeeded on the first attempt
    Ok,
    /// Skipped by a guard
    Skipped,
    /// Failed; the sequence may still have continued
    Failed,
    /// Succeeded after spending retry budget
    Retried,
    /// Terminated by abort or cancellation mid-step
    Aborted,
}

impl StepStatus {
    fn tag(self) -> &'static str {
        match self {
            StepStatus::Ok => "ok",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Retried => "retried",
            StepStatus::Aborted => "aborted",
        }
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Index into the sequence's step list
    pub step_index: usize,
    /// Terminal status
    pub status: StepStatus,
    /// Attempts spent (0 for waits, nested sequences, cache hits)
    pub attempts: u32,
    /// Elapsed milliseconds for the whole step
    pub elapsed_ms: u64,
    /// The error that decided the status, if any
    pub error: Option<EngineError>,
}

/// Terminal status of a sequence invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceStatus {
    /// Every encountered step completed or was skipped
    Ok,
    /// A step aborted the sequence or the cap was exceeded
    Failed,
    /// Cooperative cancellation ended the run
    Cancelled,
}

/// Aggregated result of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceResult {
    /// Sequence id
    pub sequence: String,
    /// Correlation id threaded through audit records
    pub correlation_id: String,
    /// Terminal status
    pub status: SequenceStatus,
    /// Per-step results in execution order
    pub steps: Vec<StepResult>,
    /// Steps that finished ok (including after retries)
    pub completed: usize,
    /// Executable steps encountered during the walk
    pub total: usize,
    /// Elapsed milliseconds
    pub elapsed_ms: u64,
    /// First non-`Cancelled` fatal error, or `Cancelled` when that is
    /// all there was
    pub error: Option<EngineError>,
}

/// How a finished step affects the enclosing sequence walk.
enum StepFlow {
    /// Record the result and move on
    Continue(StepResult),
    /// Record the result and stop with failure
    Abort(StepResult, EngineError),
    /// Record the result and stop as cancelled
    Cancelled(StepResult),
}

/// The step-walking engine. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct SequenceExecutor {
    program: Arc<Program>,
    resources: Arc<ResourceRegistry>,
    policies: Arc<PolicyEngine>,
    transport: TransportLink,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
    default_wall_cap_ms: u64,
    default_deadline_ms: u64,
    post_guards_on_timeout: bool,
}

impl SequenceExecutor {
    /// Wire an executor over one loaded program and its runtime stores.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: Arc<Program>,
        resources: Arc<ResourceRegistry>,
        policies: Arc<PolicyEngine>,
        transport: TransportLink,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        max_depth: u32,
        default_wall_cap_ms: u64,
        default_deadline_ms: u64,
        post_guards_on_timeout: bool,
    ) -> Self {
        Self {
            program,
            resources,
            policies,
            transport,
            bus,
            clock,
            max_depth: max_depth.max(1),
            default_wall_cap_ms,
            default_deadline_ms,
            post_guards_on_timeout,
        }
    }

    /// Execute a sequence to completion under its wall-clock cap.
    ///
    /// The future is `'static` so invocations can be spawned onto the
    /// sequence pool; recursion for nested sequences goes through here.
    pub fn execute(&self, sequence_id: String, ctx: ExecutionContext) -> BoxFuture<'static, SequenceResult> {
        let this = self.clone();
        Box::pin(async move {
            let cap_ms = this
                .program
                .config
                .sequences
                .get(&sequence_id)
                .and_then(|s| s.wall_clock_cap_ms)
                .unwrap_or(this.default_wall_cap_ms);

            if cap_ms == 0 {
                return this.run_sequence(&sequence_id, &ctx).await;
            }

            let started = this.clock.now();
            tokio::select! {
                result = this.run_sequence(&sequence_id, &ctx) => result,
                _ = this.clock.sleep(Duration::from_millis(cap_ms), &ctx.cancel) => {
                    // Cap exceeded: cascade cancellation to children and
                    // report a timeout.
                    ctx.cancel.cancel();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    ctx.audit.record(
                        ctx.correlation_id.to_string(),
                        "sequence.timeout",
                        serde_json::json!({ "sequence": sequence_id, "cap_ms": cap_ms }),
                    );
                    SequenceResult {
                        sequence: sequence_id.clone(),
                        correlation_id: ctx.correlation_id.to_string(),
                        status: SequenceStatus::Failed,
                        steps: Vec::new(),
                        completed: 0,
                        total: 0,
                        elapsed_ms,
                        error: Some(EngineError::Timeout { elapsed_ms }),
                    }
                }
            }
        })
    }

    async fn run_sequence(&self, sequence_id: &str, ctx: &ExecutionContext) -> SequenceResult {
        let started = self.clock.now();
        let correlation = ctx.correlation_id.to_string();

        let Some(sequence) = self.program.config.sequences.get(sequence_id) else {
            let error = EngineError::Ref {
                entity: "sequence",
                id: sequence_id.to_string(),
            };
            return SequenceResult {
                sequence: sequence_id.to_string(),
                correlation_id: correlation,
                status: SequenceStatus::Failed,
                steps: Vec::new(),
                completed: 0,
                total: 0,
                elapsed_ms: 0,
                error: Some(error),
            };
        };

        ctx.audit.record(
            correlation.clone(),
            "sequence.started",
            serde_json::json!({ "sequence": sequence_id, "depth": ctx.depth }),
        );
        tracing::debug!(sequence = sequence_id, depth = ctx.depth, "sequence started");

        let blocks = self.program.blocks.get(sequence_id);
        let else_to_endif: BTreeMap<usize, usize> = blocks
            .map(|table| {
                table
                    .values()
                    .filter_map(|b| b.else_index.map(|e| (e, b.endif_index)))
                    .collect()
            })
            .unwrap_or_default();

        let mut steps: Vec<StepResult> = Vec::new();
        let mut completed = 0usize;
        let mut total = 0usize;
        let mut status = SequenceStatus::Ok;
        let mut error: Option<EngineError> = None;

        let mut index = 0usize;
        while index < sequence.steps.len() {
            if ctx.cancel.is_cancelled() {
                status = SequenceStatus::Cancelled;
                error.get_or_insert(EngineError::Cancelled);
                break;
            }

            let step = &sequence.steps[index];
            match step {
                Step::If { condition } => {
                    match self.eval_condition(condition, ctx) {
                        Ok(true) => index += 1,
                        Ok(false) => {
                            let block = blocks
                                .and_then(|t| t.get(&index))
                                .copied()
                                .expect("validated if has a block span");
                            index = match block.else_index {
                                Some(else_index) => else_index + 1,
                                None => block.endif_index + 1,
                            };
                        }
                        Err(e) => {
                            status = SequenceStatus::Failed;
                            error = Some(e);
                            break;
                        }
                    }
                }
                Step::Else => {
                    // Reached from the taken branch: jump past the block.
                    let endif = *else_to_endif.get(&index).expect("validated else has endif");
                    index = endif + 1;
                }
                Step::EndIf => index += 1,
                _ => {
                    total += 1;
                    let flow = self
                        .run_executable_step(sequence_id, sequence, index, step, ctx)
                        .await;
                    match flow {
                        StepFlow::Continue(result) => {
                            if matches!(result.status, StepStatus::Ok | StepStatus::Retried) {
                                completed += 1;
                            }
                            steps.push(result);
                            index += 1;
                        }
                        StepFlow::Abort(result, e) => {
                            steps.push(result);
                            status = SequenceStatus::Failed;
                            error = Some(e);
                            break;
                        }
                        StepFlow::Cancelled(result) => {
                            steps.push(result);
                            status = SequenceStatus::Cancelled;
                            error.get_or_insert(EngineError::Cancelled);
                            break;
                        }
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        ctx.audit.record(
            correlation.clone(),
            "sequence.finished",
            serde_json::json!({
                "sequence": sequence_id,
                "status": match status {
                    SequenceStatus::Ok => "ok",
                    SequenceStatus::Failed => "failed",
                    SequenceStatus::Cancelled => "cancelled",
                },
                "completed": completed,
                "total": total,
                "elapsed_ms": elapsed_ms,
            }),
        );

        SequenceResult {
            sequence: sequence_id.to_string(),
            correlation_id: correlation,
            status,
            steps,
            completed,
            total,
            elapsed_ms,
            error,
        }
    }

    fn eval_condition(&self, condition_id: &str, ctx: &ExecutionContext) -> EngineResult<bool> {
        let compiled = self
            .program
            .conditions
            .get(condition_id)
            .ok_or_else(|| EngineError::Ref {
                entity: "condition",
                id: condition_id.to_string(),
            })?;
        let scope = ctx.eval_scope(None, None);
        match expr::eval(compiled, &scope)? {
            Scalar::Bool(value) => Ok(value),
            _ => Err(EngineError::Expr(crate::expr::ExprError::Type {
                message: format!("condition '{}' did not evaluate to a boolean", condition_id),
            })),
        }
    }

    async fn run_executable_step(
        &self,
        sequence_id: &str,
        sequence: &Sequence,
        step_index: usize,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> StepFlow {
        let step_started = self.clock.now();
        let flow = match step {
            Step::Wait { seconds } => self.run_wait_step(step_index, *seconds, ctx).await,
            Step::Sequence { sequence: child } => {
                self.run_nested_step(sequence, step_index, child, ctx).await
            }
            Step::Parallel { branches } => {
                self.run_parallel_step(sequence, step_index, branches, ctx).await
            }
            Step::Command { command, args, lets } => {
                self.run_command_step(sequence_id, sequence, step_index, command, args, lets, ctx)
                    .await
            }
            Step::If { .. } | Step::Else | Step::EndIf => unreachable!("markers handled by the walk"),
        };

        // Stamp elapsed time and emit the step event uniformly.
        let elapsed_ms = step_started.elapsed().as_millis() as u64;
        let stamp = |mut result: StepResult| {
            result.elapsed_ms = elapsed_ms;
            self.emit_step_event(sequence_id, &result, ctx);
            result
        };
        match flow {
            StepFlow::Continue(r) => StepFlow::Continue(stamp(r)),
            StepFlow::Abort(r, e) => StepFlow::Abort(stamp(r), e),
            StepFlow::Cancelled(r) => StepFlow::Cancelled(stamp(r)),
        }
    }

    fn emit_step_event(&self, sequence_id: &str, result: &StepResult, ctx: &ExecutionContext) {
        let kind = match result.status {
            StepStatus::Ok | StepStatus::Retried | StepStatus::Skipped => "step.completed",
            StepStatus::Failed | StepStatus::Aborted => "step.failed",
        };
        ctx.audit.record(
            ctx.correlation_id.to_string(),
            kind,
            serde_json::json!({
                "sequence": sequence_id,
                "step_index": result.step_index,
                "attempts": result.attempts,
                "elapsed_ms": result.elapsed_ms,
                "status": result.status.tag(),
            }),
        );

        let mut payload = BTreeMap::new();
        payload.insert("kind".to_string(), Scalar::Str(kind.to_string()));
        payload.insert("sequence".to_string(), Scalar::Str(sequence_id.to_string()));
        payload.insert("step_index".to_string(), Scalar::Num(result.step_index as f64));
        payload.insert("attempts".to_string(), Scalar::Num(result.attempts as f64));
        payload.insert("elapsed_ms".to_string(), Scalar::Num(result.elapsed_ms as f64));
        payload.insert("status".to_string(), Scalar::Str(result.status.tag().to_string()));
        self.bus.publish_from_source("step", payload);
    }

    async fn run_wait_step(&self, step_index: usize, seconds: f64, ctx: &ExecutionContext) -> StepFlow {
        let duration = Duration::from_secs_f64(seconds.max(0.0));
        match self.clock.sleep(duration, &ctx.cancel).await {
            Ok(()) => StepFlow::Continue(StepResult {
                step_index,
                status: StepStatus::Ok,
                attempts: 0,
                elapsed_ms: 0,
                error: None,
            }),
            Err(_) => StepFlow::Cancelled(StepResult {
                step_index,
                status: StepStatus::Aborted,
                attempts: 0,
                elapsed_ms: 0,
                error: Some(EngineError::Cancelled),
            }),
        }
    }

    async fn run_nested_step(
        &self,
        sequence: &Sequence,
        step_index: usize,
        child_id: &str,
        ctx: &ExecutionContext,
    ) -> StepFlow {
        if ctx.depth + 1 >= self.max_depth {
            let error = EngineError::Ref {
                entity: "sequence (nesting depth cap reached)",
                id: child_id.to_string(),
            };
            return StepFlow::Abort(
                StepResult {
                    step_index,
                    status: StepStatus::Aborted,
                    attempts: 0,
                    elapsed_ms: 0,
                    error: Some(error.clone()),
                },
                error,
            );
        }

        let child_result = self.execute(child_id.to_string(), ctx.child()).await;
        match child_result.status {
            SequenceStatus::Ok => StepFlow::Continue(StepResult {
                step_index,
                status: StepStatus::Ok,
                attempts: 0,
                elapsed_ms: 0,
                error: None,
            }),
            SequenceStatus::Cancelled => StepFlow::Cancelled(StepResult {
                step_index,
                status: StepStatus::Aborted,
                attempts: 0,
                elapsed_ms: 0,
                error: Some(EngineError::Cancelled),
            }),
            SequenceStatus::Failed => {
                let error = child_result.error.unwrap_or(EngineError::Ref {
                    entity: "sequence",
                    id: child_id.to_string(),
                });
                self.finish_failed_attempt(sequence, step_index, 0, error, ctx).await
            }
        }
    }

    async fn run_parallel_step(
        &self,
        sequence: &Sequence,
        step_index: usize,
        branches: &[String],
        ctx: &ExecutionContext,
    ) -> StepFlow {
        let mut children = Vec::new();
        let mut tasks = FuturesUnordered::new();
        for branch in branches {
            let child_ctx = ctx.child();
            children.push(child_ctx.cancel.clone());
            let future = self.execute(branch.clone(), child_ctx);
            tasks.push(tokio::spawn(future));
        }

        let mut first_error: Option<EngineError> = None;
        let mut cancelled = false;
        while let Some(joined) = tasks.next().await {
            let branch_result = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!(%join_error, "parallel branch task failed");
                    first_error.get_or_insert(EngineError::Cancelled);
                    continue;
                }
            };
            match branch_result.status {
                SequenceStatus::Ok => {}
                SequenceStatus::Cancelled => {
                    cancelled = true;
                }
                SequenceStatus::Failed => {
                    if first_error.is_none() {
                        first_error = branch_result.error.clone();
                        // Abort in one sibling cancels the rest; partial
                        // successes stay as they are.
                        for token in &children {
                            token.cancel();
                        }
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return self.finish_failed_attempt(sequence, step_index, 0, error, ctx).await;
        }
        if cancelled || ctx.cancel.is_cancelled() {
            return StepFlow::Cancelled(StepResult {
                step_index,
                status: StepStatus::Aborted,
                attempts: 0,
                elapsed_ms: 0,
                error: Some(EngineError::Cancelled),
            });
        }
        StepFlow::Continue(StepResult {
            step_index,
            status: StepStatus::Ok,
            attempts: 0,
            elapsed_ms: 0,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command_step(
        &self,
        sequence_id: &str,
        sequence: &Sequence,
        step_index: usize,
        command_id: &str,
        args: &BTreeMap<String, String>,
        lets: &BTreeMap<String, Scalar>,
        ctx: &ExecutionContext,
    ) -> StepFlow {
        let Some(command) = self.program.config.commands.get(command_id) else {
            let error = EngineError::Ref {
                entity: "command",
                id: command_id.to_string(),
            };
            return StepFlow::Abort(
                StepResult {
                    step_index,
                    status: StepStatus::Aborted,
                    attempts: 0,
                    elapsed_ms: 0,
                    error: Some(error.clone()),
                },
                error,
            );
        };

        let policy = self.effective_policy(sequence);
        let owner = format!("{}#{}", sequence_id, ctx.correlation_id);
        let mut remaining = policy.max_attempts.max(1);
        let mut attempts_total: u32 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return StepFlow::Cancelled(self.step_result(
                    step_index,
                    StepStatus::Aborted,
                    attempts_total,
                    Some(EngineError::Cancelled),
                ));
            }

            // 1. Render the line from the effective scope.
            let line = match self.render_line(command_id, command, args, lets, ctx) {
                Ok(line) => line,
                Err(error) => {
                    return self
                        .finish_failed_attempt(sequence, step_index, attempts_total, error, ctx)
                        .await;
                }
            };

            // 2. Pre-guards.
            let scope = ctx.eval_scope(Some(lets), None);
            let pre = match guard::check_guards(&self.program, GuardWhen::Pre, &sequence.guards, &scope)
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    return StepFlow::Abort(
                        self.step_result(step_index, StepStatus::Aborted, attempts_total, Some(error.clone())),
                        error,
                    );
                }
            };
            drop(scope);
            if let GuardOutcome::Fail { guard, action, error } = pre {
                tracing::debug!(sequence = sequence_id, %guard, "pre-guard failed");
                match self
                    .apply_guard_action(sequence, step_index, attempts_total, action, error, &mut remaining, ctx)
                    .await
                {
                    GuardFlow::RetryStep => continue,
                    GuardFlow::Done(flow) => return flow,
                }
            }

            // 3. Resources, in declared textual order.
            let acquire_timeout = Duration::from_millis(
                (policy.timeout_ms / (sequence.resources.len() as u64 + 1)).max(1),
            );
            let mut grants: Vec<ResourceGrant> = Vec::new();
            let mut acquire_error: Option<EngineError> = None;
            for resource in &sequence.resources {
                match self
                    .resources
                    .acquire(resource, &owner, acquire_timeout, &ctx.cancel)
                    .await
                {
                    Ok(grant) => grants.push(grant),
                    Err(error) => {
                        acquire_error = Some(error);
                        break;
                    }
                }
            }
            if let Some(error) = acquire_error {
                // Grants drop here, releasing in reverse of nothing held.
                drop(grants);
                match error {
                    EngineError::Cancelled => {
                        return StepFlow::Cancelled(self.step_result(
                            step_index,
                            StepStatus::Aborted,
                            attempts_total,
                            Some(EngineError::Cancelled),
                        ));
                    }
                    error if error.is_retryable() && remaining > 1 => {
                        remaining -= 1;
                        attempts_total += 1;
                        continue;
                    }
                    error => {
                        return self
                            .finish_failed_attempt(sequence, step_index, attempts_total + 1, error, ctx)
                            .await;
                    }
                }
            }

            // 4. Policy-wrapped transport attempt(s).
            let idempotency_key = self.render_idempotency_key(&policy, lets, ctx);
            let run = {
                let transport = self.transport.clone();
                let resources = Arc::clone(&self.resources);
                let cancel = ctx.cancel.clone();
                let line = line.clone();
                let owner = owner.clone();
                let expect = command.expect.clone();
                let deadline = Duration::from_millis(policy.timeout_ms.max(1));
                self.policies
                    .run(
                        &policy,
                        remaining,
                        idempotency_key.as_deref(),
                        &ctx.cancel,
                        move |_attempt| {
                            let transport = transport.clone();
                            let resources = Arc::clone(&resources);
                            let cancel = cancel.clone();
                            let line = line.clone();
                            let owner = owner.clone();
                            let expect = expect.clone();
                            async move {
                                // The built-in transport mutex is held for
                                // exactly one attempt.
                                let _wire = resources
                                    .acquire(TRANSPORT_RESOURCE, &owner, deadline, &cancel)
                                    .await?;
                                send_attempt(&transport, &line, deadline, expect.as_deref()).await
                            }
                        },
                    )
                    .await
            };
            attempts_total += run.attempts;
            remaining = remaining.saturating_sub(run.attempts);

            // 5. Post-guards (unless aborted/skipped; timeouts obey the
            // configured knob).
            let run_post = match &run.output {
                Err(EngineError::Cancelled) => false,
                Err(EngineError::Timeout { .. }) => self.post_guards_on_timeout,
                _ => true,
            };
            let post = if run_post {
                let scope = ctx.eval_scope(Some(lets), None);
                match guard::check_guards(&self.program, GuardWhen::Post, &sequence.guards, &scope) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        drop(grants);
                        return StepFlow::Abort(
                            self.step_result(step_index, StepStatus::Aborted, attempts_total, Some(error.clone())),
                            error,
                        );
                    }
                }
            } else {
                GuardOutcome::Pass
            };

            // 6. Release in reverse acquisition order.
            while let Some(grant) = grants.pop() {
                grant.release();
            }

            match run.output {
                Ok(output) => {
                    if let Some(payload) = &output.payload {
                        self.apply_payload_status(payload, ctx);
                    }
                    match post {
                        GuardOutcome::Pass => {
                            let status = if attempts_total > 1 {
                                StepStatus::Retried
                            } else {
                                StepStatus::Ok
                            };
                            return StepFlow::Continue(self.step_result(
                                step_index,
                                status,
                                attempts_total,
                                None,
                            ));
                        }
                        GuardOutcome::Fail { guard, action, error } => {
                            tracing::debug!(sequence = sequence_id, %guard, "post-guard failed");
                            match self
                                .apply_guard_action(
                                    sequence,
                                    step_index,
                                    attempts_total,
                                    action,
                                    error,
                                    &mut remaining,
                                    ctx,
                                )
                                .await
                            {
                                GuardFlow::RetryStep => continue,
                                GuardFlow::Done(flow) => return flow,
                            }
                        }
                    }
                }
                Err(EngineError::Cancelled) => {
                    return StepFlow::Cancelled(self.step_result(
                        step_index,
                        StepStatus::Aborted,
                        attempts_total,
                        Some(EngineError::Cancelled),
                    ));
                }
                Err(error) => {
                    // A failing post-guard still decides the outcome even
                    // when the transport attempt itself gave up; only a
                    // pass falls through to `on_error`.
                    match post {
                        GuardOutcome::Fail { guard, action, error: guard_error } => {
                            tracing::debug!(sequence = sequence_id, %guard, "post-guard failed");
                            match self
                                .apply_guard_action(
                                    sequence,
                                    step_index,
                                    attempts_total,
                                    action,
                                    guard_error,
                                    &mut remaining,
                                    ctx,
                                )
                                .await
                            {
                                GuardFlow::RetryStep => continue,
                                GuardFlow::Done(flow) => return flow,
                            }
                        }
                        GuardOutcome::Pass => {
                            return self
                                .finish_failed_attempt(sequence, step_index, attempts_total, error, ctx)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Build the policy in effect for a sequence's command steps.
    fn effective_policy(&self, sequence: &Sequence) -> Policy {
        sequence
            .policy
            .as_ref()
            .and_then(|id| self.program.config.policies.get(id))
            .cloned()
            .unwrap_or(Policy {
                max_attempts: 1,
                backoff: Default::default(),
                timeout_ms: self.default_deadline_ms,
                idempotency_key: None,
            })
    }

    fn render_line(
        &self,
        command_id: &str,
        command: &Command,
        args: &BTreeMap<String, String>,
        lets: &BTreeMap<String, Scalar>,
        ctx: &ExecutionContext,
    ) -> EngineResult<String> {
        let lookup = |name: &str| -> Option<Scalar> {
            lets.get(name).cloned().or_else(|| ctx.var(name))
        };
        let resolve = |name: &str| -> Option<String> {
            if let Some(raw) = args.get(name) {
                return template::render(raw, |inner| lookup(inner).map(|v| v.render())).ok();
            }
            if let Some(value) = lookup(name) {
                return Some(value.render());
            }
            command.defaults.get(name).and_then(|default| {
                template::render(&default.render(), |inner| lookup(inner).map(|v| v.render())).ok()
            })
        };

        let line = template::render(&command.line, resolve).map_err(|param| {
            EngineError::ParamMissing {
                command: command_id.to_string(),
                param,
            }
        })?;

        // Parameter value validators: a violating value counts as
        // unresolved.
        for (param, validator_id) in &command.validators {
            let Some(validator) = self.program.config.validators.get(validator_id) else {
                continue;
            };
            let Some(value) = resolve(param) else { continue };
            let mut ok = true;
            if !validator.allowed.is_empty() && !validator.allowed.contains(&value) {
                ok = false;
            }
            if validator.min.is_some() || validator.max.is_some() {
                match value.parse::<f64>() {
                    Ok(number) => {
                        if let Some(min) = validator.min {
                            ok &= number >= min;
                        }
                        if let Some(max) = validator.max {
                            ok &= number <= max;
                        }
                    }
                    Err(_) => ok = false,
                }
            }
            if !ok {
                tracing::warn!(
                    command = command_id,
                    param = %param,
                    value = %value,
                    validator = %validator_id,
                    "parameter value rejected by validator"
                );
                return Err(EngineError::ParamMissing {
                    command: command_id.to_string(),
                    param: param.clone(),
                });
            }
        }

        Ok(line)
    }

    fn render_idempotency_key(
        &self,
        policy: &Policy,
        lets: &BTreeMap<String, Scalar>,
        ctx: &ExecutionContext,
    ) -> Option<String> {
        let template_src = policy.idempotency_key.as_deref()?;
        let lookup = |name: &str| -> Option<String> {
            lets.get(name)
                .cloned()
                .or_else(|| ctx.var(name))
                .map(|v| v.render())
        };
        template::render(template_src, lookup).ok().filter(|k| !k.is_empty())
    }

    /// Parse `KEY=VALUE` response payloads onto the status board so
    /// later conditions can read them with `status("KEY")`.
    fn apply_payload_status(&self, payload: &str, ctx: &ExecutionContext) {
        if let Some((key, value)) = payload.split_once('=') {
            let key = key.trim();
            if key.is_empty() || key.contains(' ') {
                return;
            }
            let scalar = value
                .trim()
                .parse::<f64>()
                .map(Scalar::Num)
                .unwrap_or_else(|_| Scalar::Str(value.trim().to_string()));
            ctx.board.set_status(key, scalar);
        }
    }

    fn step_result(
        &self,
        step_index: usize,
        status: StepStatus,
        attempts: u32,
        error: Option<EngineError>,
    ) -> StepResult {
        StepResult {
            step_index,
            status,
            attempts,
            elapsed_ms: 0,
            error,
        }
    }

    /// Apply a guard's `on_fail` action.
    async fn apply_guard_action(
        &self,
        sequence: &Sequence,
        step_index: usize,
        attempts: u32,
        action: GuardAction,
        error: EngineError,
        remaining: &mut u32,
        ctx: &ExecutionContext,
    ) -> GuardFlow {
        match action {
            GuardAction::Abort => GuardFlow::Done(StepFlow::Abort(
                self.step_result(step_index, StepStatus::Aborted, attempts, Some(error.clone())),
                error,
            )),
            GuardAction::Skip => GuardFlow::Done(StepFlow::Continue(self.step_result(
                step_index,
                StepStatus::Skipped,
                attempts,
                Some(error),
            ))),
            GuardAction::Retry => {
                if *remaining > 1 {
                    *remaining -= 1;
                    GuardFlow::RetryStep
                } else {
                    GuardFlow::Done(StepFlow::Abort(
                        self.step_result(step_index, StepStatus::Aborted, attempts, Some(error.clone())),
                        error,
                    ))
                }
            }
            GuardAction::Compensate { sequence: comp } => {
                self.run_compensation(step_index, attempts, &comp, error, ctx).await
            }
        }
    }

    /// Run a compensation sequence synchronously in the same context.
    /// Success marks the original step failed but lets the sequence
    /// continue; failure escalates to abort. Compensation never draws
    /// from the step's retry budget and runs at most once per failure.
    async fn run_compensation(
        &self,
        step_index: usize,
        attempts: u32,
        compensation_id: &str,
        original_error: EngineError,
        ctx: &ExecutionContext,
    ) -> GuardFlow {
        tracing::debug!(compensation = compensation_id, "running compensation sequence");
        let result = self.execute(compensation_id.to_string(), ctx.child()).await;
        match result.status {
            SequenceStatus::Ok => GuardFlow::Done(StepFlow::Continue(self.step_result(
                step_index,
                StepStatus::Failed,
                attempts,
                Some(original_error),
            ))),
            SequenceStatus::Cancelled => GuardFlow::Done(StepFlow::Cancelled(self.step_result(
                step_index,
                StepStatus::Aborted,
                attempts,
                Some(EngineError::Cancelled),
            ))),
            SequenceStatus::Failed => {
                let escalated = result.error.unwrap_or(original_error);
                GuardFlow::Done(StepFlow::Abort(
                    self.step_result(step_index, StepStatus::Aborted, attempts, Some(escalated.clone())),
                    escalated,
                ))
            }
        }
    }

    /// A step ran out of options with `error`; apply the sequence's
    /// `on_error` action (abort by default).
    async fn finish_failed_attempt(
        &self,
        sequence: &Sequence,
        step_index: usize,
        attempts: u32,
        error: EngineError,
        ctx: &ExecutionContext,
    ) -> StepFlow {
        let action = sequence.on_error.clone().unwrap_or(GuardAction::Abort);
        match action {
            GuardAction::Skip => StepFlow::Continue(self.step_result(
                step_index,
                StepStatus::Failed,
                attempts,
                Some(error),
            )),
            GuardAction::Compensate { sequence: comp } => {
                match self.run_compensation(step_index, attempts, &comp, error, ctx).await {
                    GuardFlow::Done(flow) => flow,
                    GuardFlow::RetryStep => unreachable!("compensation never retries"),
                }
            }
            // Retry budget is already exhausted by the time a failure
            // lands here; abort is all that is left.
            GuardAction::Abort | GuardAction::Retry => StepFlow::Abort(
                self.step_result(step_index, StepStatus::Failed, attempts, Some(error.clone())),
                error,
            ),
        }
    }
}

/// Whether a guard action loops the step or settles it.
enum GuardFlow {
    /// Re-run the step from the top (budget already charged)
    RetryStep,
    /// The step is settled
    Done(StepFlow),
}

/// One transport attempt: send the line, map the response.
async fn send_attempt(
    transport: &TransportLink,
    line: &str,
    deadline: Duration,
    expect: Option<&str>,
) -> EngineResult<AttemptOutput> {
    let response = transport.send_line(line, deadline).await.map_err(|fault| match fault {
        TransportFault::Timeout => EngineError::Timeout {
            elapsed_ms: deadline.as_millis() as u64,
        },
        TransportFault::Io(message) => EngineError::Transport(message),
        TransportFault::Closed => EngineError::Transport("transport closed".to_string()),
    })?;

    match response.status {
        ResponseStatus::Err => Err(EngineError::Transport(
            response.payload.unwrap_or_else(|| "ERR".to_string()),
        )),
        ResponseStatus::Ok => {
            if let Some(prefix) = expect {
                let matches = response
                    .payload
                    .as_deref()
                    .map(|p| p.starts_with(prefix))
                    .unwrap_or(false);
                if !matches {
                    return Err(EngineError::Transport(format!(
                        "response payload does not start with '{}'",
                        prefix
                    )));
                }
            }
            Ok(AttemptOutput {
                payload: response.payload,
            })
        }
    }
}

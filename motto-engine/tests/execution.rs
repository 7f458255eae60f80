//! End-to-end execution scenarios against the scripted transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use motto_config::MottoSettings;
use motto_engine::{
    Orchestrator, Scalar, ScriptedTransport, SequenceStatus, SysClock, Transport,
};
use motto_engine::transport::ScriptedReply;
use motto_engine::EngineError;

fn orchestrator_over(transport: Arc<ScriptedTransport>) -> Arc<Orchestrator> {
    Orchestrator::new(
        MottoSettings::default(),
        transport as Arc<dyn Transport>,
        Arc::new(SysClock),
    )
}

#[tokio::test]
async fn single_command_no_guards() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("PING", vec![ScriptedReply::Ok { payload: None, delay_ms: 10 }]);
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.ping]
line = "PING"

[sequences.s]
steps = [ { command = "ping" } ]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(result.completed, 1);
    assert_eq!(result.total, 1);
    assert!(result.error.is_none());

    let completed = orchestrator.audit();
    let records = completed.of_kind("step.completed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["attempts"], 1);
    assert_eq!(transport.sent_lines(), vec!["PING".to_string()]);
    orchestrator.shutdown();
}

#[tokio::test]
async fn pre_guard_abort_sends_nothing() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.ping]
line = "PING"

[conditions.alarm_clear]
expr = 'status("alarm") == 0'

[guards.g1]
when = "pre"
condition = "alarm_clear"
on_fail = "abort"

[sequences.s]
guards = ["g1"]
steps = [ { command = "ping" } ]
"#,
        )
        .expect("loads");

    orchestrator.set_status("alarm", 1.0);
    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    assert_eq!(result.status, SequenceStatus::Failed);
    assert_eq!(
        result.error,
        Some(EngineError::GuardFail { guard: "g1".into() })
    );
    assert_eq!(transport.send_count(), 0);
    orchestrator.shutdown();
}

#[tokio::test]
async fn retry_then_success() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        "DO",
        vec![
            ScriptedReply::Fault { message: "line noise".into() },
            ScriptedReply::Fault { message: "line noise".into() },
            ScriptedReply::Ok { payload: None, delay_ms: 0 },
        ],
    );
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.c]
line = "DO"

[policies.p]
max_attempts = 3
timeout_ms = 100
backoff = { fixed = { ms = 50 } }

[sequences.s]
policy = "p"
steps = [ { command = "c" } ]
"#,
        )
        .expect("loads");

    let started = Instant::now();
    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].attempts, 3);
    // Two fixed 50 ms backoffs between three attempts.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(transport.send_count(), 3);
    orchestrator.shutdown();
}

#[tokio::test]
async fn cancellation_during_wait_is_prompt() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.cmd]
line = "CMD"

[sequences.s]
steps = [
    { wait = 10.0 },
    { command = "cmd" },
]
"#,
        )
        .expect("loads");

    let handle = orchestrator
        .execute_async("s", BTreeMap::new(), None)
        .expect("starts");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled_at = Instant::now();
    handle.cancel();
    let result = handle.wait().await;

    assert_eq!(result.status, SequenceStatus::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_millis(100));
    assert_eq!(transport.send_count(), 0);
    orchestrator.shutdown();
}

#[tokio::test]
async fn idempotent_step_skips_the_transport() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.arm]
line = "ARM {slot}"
params = ["slot"]

[policies.once]
max_attempts = 1
timeout_ms = 100
idempotency_key = "arm-{slot}"

[sequences.s]
policy = "once"
steps = [ { command = "arm", args = { slot = "{slot}" } } ]
"#,
        )
        .expect("loads");

    let mut vars = BTreeMap::new();
    vars.insert("slot".to_string(), Scalar::Num(2.0));

    let first = orchestrator
        .execute("s", vars.clone(), None)
        .await
        .expect("first run");
    assert_eq!(first.status, SequenceStatus::Ok);
    assert_eq!(transport.send_count(), 1);

    let second = orchestrator
        .execute("s", vars, None)
        .await
        .expect("second run");
    assert_eq!(second.status, SequenceStatus::Ok);
    // Cached by idempotency key: no second transport call.
    assert_eq!(transport.send_count(), 1);
    assert_eq!(second.steps[0].attempts, 0);
    orchestrator.shutdown();
}

#[tokio::test]
async fn single_attempt_policy_fails_fast_without_backoff() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("DO", vec![ScriptedReply::Fault { message: "dead".into() }]);
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.c]
line = "DO"

[policies.p]
max_attempts = 1
timeout_ms = 100
backoff = { fixed = { ms = 5000 } }

[sequences.s]
policy = "p"
steps = [ { command = "c" } ]
"#,
        )
        .expect("loads");

    let started = Instant::now();
    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    assert_eq!(result.status, SequenceStatus::Failed);
    assert_eq!(result.steps[0].attempts, 1);
    assert!(matches!(result.error, Some(EngineError::Transport(_))));
    // max_attempts = 1 disables retry: no backoff sleep happened.
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(transport.send_count(), 1);
    orchestrator.shutdown();
}

#[tokio::test]
async fn conditional_branches_follow_the_variable_scope() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[vars]
fast = false

[commands.fast_cmd]
line = "FAST"

[commands.slow_cmd]
line = "SLOW"

[contexts.main]
fields = { fast = "bool" }

[conditions.go_fast]
expr = "fast"
context = "main"

[sequences.s]
steps = [
    { if = "go_fast" },
    { command = "fast_cmd" },
    { else = true },
    { command = "slow_cmd" },
    { endif = true },
]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("default branch");
    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(transport.sent_lines(), vec!["SLOW".to_string()]);

    let mut vars = BTreeMap::new();
    vars.insert("fast".to_string(), Scalar::Bool(true));
    let result = orchestrator
        .execute("s", vars, None)
        .await
        .expect("fast branch");
    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(
        transport.sent_lines(),
        vec!["SLOW".to_string(), "FAST".to_string()]
    );
    orchestrator.shutdown();
}

#[tokio::test]
async fn nested_sequences_inherit_the_context() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[vars]
rate = 7

[commands.set_flow]
line = "FLOW {rate}"
params = ["rate"]

[sequences.inner]
steps = [ { command = "set_flow" } ]

[sequences.outer]
steps = [ { sequence = "inner" } ]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("outer", BTreeMap::new(), None)
        .await
        .expect("executes");
    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(transport.sent_lines(), vec!["FLOW 7".to_string()]);
    orchestrator.shutdown();
}

#[tokio::test]
async fn profile_overlay_shadows_global_vars() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[vars]
rate = 10

[profiles.gentle]
vars = { rate = 2 }

[commands.set_flow]
line = "FLOW {rate}"
params = ["rate"]

[sequences.s]
steps = [ { command = "set_flow" } ]
"#,
        )
        .expect("loads");

    orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("default profile");
    orchestrator
        .execute("s", BTreeMap::new(), Some("gentle"))
        .await
        .expect("gentle profile");

    assert_eq!(
        transport.sent_lines(),
        vec!["FLOW 10".to_string(), "FLOW 2".to_string()]
    );
    orchestrator.shutdown();
}

#[tokio::test]
async fn missing_parameter_fails_the_step() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.move_to]
line = "MOVE {x}"
params = ["x"]

[sequences.s]
steps = [ { command = "move_to", args = { x = "{target}" } } ]
"#,
        )
        .expect("loads");

    // `target` resolves nowhere at dispatch.
    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");
    assert_eq!(result.status, SequenceStatus::Failed);
    assert!(matches!(
        result.error,
        Some(EngineError::ParamMissing { .. })
    ));
    assert_eq!(transport.send_count(), 0);
    orchestrator.shutdown();
}

#[tokio::test]
async fn compensation_keeps_the_sequence_going() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("FRAGILE", vec![ScriptedReply::Err { message: "E12".into(), delay_ms: 0 }]);
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.fragile]
line = "FRAGILE"

[commands.cleanup]
line = "CLEANUP"

[commands.next]
line = "NEXT"

[sequences.recover]
steps = [ { command = "cleanup" } ]

[sequences.s]
on_error = { compensate = { sequence = "recover" } }
steps = [
    { command = "fragile" },
    { command = "next" },
]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    // The fragile step failed, compensation ran, and the sequence
    // continued with the next step.
    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(
        transport.sent_lines(),
        vec![
            "FRAGILE".to_string(),
            "CLEANUP".to_string(),
            "NEXT".to_string()
        ]
    );
    assert_eq!(result.completed, 1);
    assert_eq!(result.total, 2);
    orchestrator.shutdown();
}

#[tokio::test]
async fn post_guard_skip_applies_when_the_transport_also_failed() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("BAD", vec![ScriptedReply::Fault { message: "dead line".into() }]);
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.bad]
line = "BAD"

[conditions.never]
expr = "false"

[guards.g_post]
when = "post"
condition = "never"
on_fail = "skip"

[sequences.s]
guards = ["g_post"]
steps = [ { command = "bad" } ]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    // The failing post-guard decides the step, not the default abort:
    // the step is skipped and the sequence finishes cleanly.
    assert_eq!(result.status, SequenceStatus::Ok);
    assert!(result.error.is_none());
    assert_eq!(result.steps.len(), 1);
    assert!(matches!(
        result.steps[0].status,
        motto_engine::StepStatus::Skipped
    ));
    assert_eq!(transport.sent_lines(), vec!["BAD".to_string()]);
    orchestrator.shutdown();
}

#[tokio::test]
async fn post_guard_compensation_applies_when_the_transport_also_failed() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("BAD", vec![ScriptedReply::Fault { message: "dead line".into() }]);
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[commands.bad]
line = "BAD"

[commands.cleanup]
line = "CLEANUP"

[sequences.recover]
steps = [ { command = "cleanup" } ]

[conditions.never]
expr = "false"

[guards.g_post]
when = "post"
condition = "never"
on_fail = { compensate = { sequence = "recover" } }

[sequences.s]
guards = ["g_post"]
steps = [ { command = "bad" } ]
"#,
        )
        .expect("loads");

    let result = orchestrator
        .execute("s", BTreeMap::new(), None)
        .await
        .expect("executes");

    // The guard's compensation ran, not `on_error`'s plain abort: the
    // step is marked failed and the sequence continues to completion.
    assert_eq!(result.status, SequenceStatus::Ok);
    assert_eq!(
        transport.sent_lines(),
        vec!["BAD".to_string(), "CLEANUP".to_string()]
    );
    assert_eq!(result.steps.len(), 1);
    assert!(matches!(
        result.steps[0].status,
        motto_engine::StepStatus::Failed
    ));
    orchestrator.shutdown();
}

#[tokio::test]
async fn wall_clock_cap_times_the_sequence_out() {
    let transport = Arc::new(ScriptedTransport::new());
    let orchestrator = orchestrator_over(Arc::clone(&transport));
    orchestrator
        .load(
            br#"
version = "1.1"

[sequences.slow]
wall_clock_cap_ms = 80
steps = [ { wait = 30.0 } ]
"#,
        )
        .expect("loads");

    let started = Instant::now();
    let result = orchestrator
        .execute("slow", BTreeMap::new(), None)
        .await
        .expect("executes");

    assert_eq!(result.status, SequenceStatus::Failed);
    assert!(matches!(result.error, Some(EngineError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));
    orchestrator.shutdown();
}

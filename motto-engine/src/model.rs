//! Typed configuration model
//!
//! Entities are immutable after load. Sections are keyed by stable string
//! ids; insertion order is preserved only where it is semantic (sequence
//! steps, handler action lists, resource members, template instances) —
//! everything else is a `BTreeMap` so the canonical serialized form is
//! byte-stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration format versions this engine accepts.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0", "1.1"];

/// Id of the built-in mutex every command step holds for one attempt.
pub const TRANSPORT_RESOURCE: &str = "transport";

/// Maximum nested sequence depth unless overridden by settings.
pub const DEFAULT_MAX_DEPTH: u32 = 32;

/// A TOML scalar as it appears in `vars`, overlays, and `let` bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean literal
    Bool(bool),
    /// Numeric literal (integers widen to f64)
    Num(f64),
    /// String literal
    Str(String),
}

impl Scalar {
    /// Render the scalar the way it is substituted into a command line.
    ///
    /// Whole numbers print without a trailing `.0` so that `FLOW {rate}`
    /// with `rate = 10` renders `FLOW 10`, which is what the device
    /// grammar expects.
    pub fn render(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Scalar::Str(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Num(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Declared type of a context or payload field, used for expression
/// type-checking at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Boolean field
    Bool,
    /// Numeric field
    Num,
    /// String field
    Str,
}

/// Named set of context fields an expression may reference.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextDecl {
    /// Field name → declared type
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

/// A named line-oriented device command with `{param}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Literal line template; placeholders use `{name}` syntax
    pub line: String,
    /// Declared parameter names (placeholders must be a subset)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    /// Default values for parameters absent at the call site
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, Scalar>,
    /// Advisory unit references per parameter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, String>,
    /// Value validators per parameter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validators: BTreeMap<String, String>,
    /// Expected payload prefix; absent means plain OK/ERR discipline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
}

/// A single executable element of a sequence.
///
/// The TOML form is a table with exactly one discriminating key
/// (`command`, `sequence`, `wait`, `if`, `else`, `endif`, `parallel`);
/// [`RawStep`] is the serde bridge that enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Step {
    /// Invoke a command with an argument map and optional `let` bindings
    Command {
        /// Command id
        command: String,
        /// Call-site arguments; values may themselves contain `{param}`
        args: BTreeMap<String, String>,
        /// Step-local variable bindings, innermost scope
        lets: BTreeMap<String, Scalar>,
    },
    /// Run a nested sequence
    Sequence {
        /// Sequence id
        sequence: String,
    },
    /// Sleep for the given number of seconds (cancellable)
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Open a conditional block gated on a condition id
    If {
        /// Condition id
        condition: String,
    },
    /// Alternate branch marker of the innermost open `if`
    Else,
    /// Close the innermost open `if`
    EndIf,
    /// Fan out the named sequences as parallel siblings
    Parallel {
        /// Child sequence ids
        branches: Vec<String>,
    },
}

/// Serde bridge for [`Step`]: a flat table where exactly one
/// discriminating key must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    args: BTreeMap<String, String>,
    #[serde(default, rename = "let", skip_serializing_if = "BTreeMap::is_empty")]
    lets: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait: Option<f64>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    if_condition: Option<String>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    else_marker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endif: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel: Option<Vec<String>>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let discriminators = [
            raw.command.is_some(),
            raw.sequence.is_some(),
            raw.wait.is_some(),
            raw.if_condition.is_some(),
            raw.else_marker.is_some(),
            raw.endif.is_some(),
            raw.parallel.is_some(),
        ];
        let set = discriminators.iter().filter(|d| **d).count();
        if set != 1 {
            return Err(format!(
                "step must have exactly one of command/sequence/wait/if/else/endif/parallel, found {}",
                set
            ));
        }
        if let Some(command) = raw.command {
            return Ok(Step::Command {
                command,
                args: raw.args,
                lets: raw.lets,
            });
        }
        if !raw.args.is_empty() || !raw.lets.is_empty() {
            return Err("args/let are only valid on command steps".to_string());
        }
        if let Some(sequence) = raw.sequence {
            return Ok(Step::Sequence { sequence });
        }
        if let Some(seconds) = raw.wait {
            if !(seconds.is_finite() && seconds >= 0.0) {
                return Err(format!("wait seconds must be finite and >= 0, got {}", seconds));
            }
            return Ok(Step::Wait { seconds });
        }
        if let Some(condition) = raw.if_condition {
            return Ok(Step::If { condition });
        }
        if raw.else_marker.is_some() {
            return Ok(Step::Else);
        }
        if raw.endif.is_some() {
            return Ok(Step::EndIf);
        }
        let branches = raw.parallel.expect("one discriminator is set");
        Ok(Step::Parallel { branches })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let mut raw = RawStep::default();
        match step {
            Step::Command { command, args, lets } => {
                raw.command = Some(command);
                raw.args = args;
                raw.lets = lets;
            }
            Step::Sequence { sequence } => raw.sequence = Some(sequence),
            Step::Wait { seconds } => raw.wait = Some(seconds),
            Step::If { condition } => raw.if_condition = Some(condition),
            Step::Else => raw.else_marker = Some(true),
            Step::EndIf => raw.endif = Some(true),
            Step::Parallel { branches } => raw.parallel = Some(branches),
        }
        raw
    }
}

/// An ordered, possibly nested composition of steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sequence {
    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Retry/timeout policy applied to every command step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// Guard ids; each guard declares its own pre/post point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,
    /// Resources acquired around each step, in this textual order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    /// Action when a step fails and no guard decided otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<GuardAction>,
    /// Optional wall-clock cap for one invocation of this sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_clock_cap_ms: Option<u64>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named boolean expression over declared context fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Expression in the restricted grammar
    pub expr: String,
    /// Context declaration the expression is typed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Point at which a guard runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardWhen {
    /// Before resource acquisition and dispatch
    Pre,
    /// After the transport attempt
    Post,
}

/// Action taken when a guard fails (or a step errors out).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardAction {
    /// Terminate the enclosing sequence with failure
    Abort,
    /// Mark the step skipped and continue
    Skip,
    /// Consume one retry from the step policy; abort when exhausted
    Retry,
    /// Run the named sequence synchronously, then continue or abort
    Compensate {
        /// Compensation sequence id
        sequence: String,
    },
}

/// A boolean check bound to a pre/post point with a failure action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    /// When the guard runs
    pub when: GuardWhen,
    /// Condition id evaluated by the guard
    pub condition: String,
    /// Action on failure
    pub on_fail: GuardAction,
}

/// Backoff shape between failed attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// No delay between attempts
    #[default]
    None,
    /// Constant delay
    Fixed {
        /// Delay in milliseconds
        ms: u64,
    },
    /// Exponentially growing delay with a cap and optional jitter
    Exponential {
        /// First delay in milliseconds
        initial_ms: u64,
        /// Multiplier applied after each failure
        factor: f64,
        /// Upper bound on the delay
        cap_ms: u64,
        /// Add a uniform sample from `[0, current_delay]`
        #[serde(default)]
        jitter: bool,
    },
}

fn default_max_attempts() -> u32 {
    1
}

/// Declarative retry/backoff/timeout/idempotency wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Total attempts including the first (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay shape between failed attempts
    #[serde(default)]
    pub backoff: Backoff,
    /// Per-attempt cap in milliseconds (> 0)
    pub timeout_ms: u64,
    /// Template for the idempotency key; empty expansion disables caching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Kind and capacity of a named resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Capacity 1
    #[default]
    Mutex,
    /// Capacity `permits`
    Semaphore {
        /// Number of concurrent holders (>= 1)
        permits: u32,
    },
}

/// A named mutex or semaphore acquired for the duration of a step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    /// Mutex or semaphore(n)
    #[serde(default)]
    pub kind: ResourceKind,
    /// Logical sub-resources; a grant holds exactly one member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl Resource {
    /// Effective capacity: member count when members are declared,
    /// otherwise the declared kind's capacity.
    pub fn capacity(&self) -> u32 {
        if !self.members.is_empty() {
            return self.members.len() as u32;
        }
        match self.kind {
            ResourceKind::Mutex => 1,
            ResourceKind::Semaphore { permits } => permits,
        }
    }
}

fn default_filter() -> String {
    "true".to_string()
}

/// A typed notification matched to handlers by source tag and filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Source tag matched against emissions (`"step"`, `"transport"`, …)
    pub source: String,
    /// Boolean filter over `{payload, context}`; defaults to `true`
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Declared payload fields for filter type-checking
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, FieldType>,
    /// Context declaration the filter may additionally reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Publish this event periodically (timer source)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<u64>,
}

/// One handler action: a sequence to run or a built-in.
///
/// Serialized as a plain string; built-ins start with `@`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HandlerAction {
    /// Run the named sequence
    Run(String),
    /// Cancel every running sequence (`@cancel-all`)
    CancelAll,
    /// Publish another event (`@publish:event_id`)
    Publish(String),
}

impl TryFrom<String> for HandlerAction {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if let Some(builtin) = s.strip_prefix('@') {
            if builtin == "cancel-all" {
                return Ok(HandlerAction::CancelAll);
            }
            if let Some(event) = builtin.strip_prefix("publish:") {
                if event.is_empty() {
                    return Err("@publish: requires an event id".to_string());
                }
                return Ok(HandlerAction::Publish(event.to_string()));
            }
            return Err(format!("unknown built-in action '@{}'", builtin));
        }
        if s.is_empty() {
            return Err("action must not be empty".to_string());
        }
        Ok(HandlerAction::Run(s))
    }
}

impl From<HandlerAction> for String {
    fn from(action: HandlerAction) -> String {
        match action {
            HandlerAction::Run(seq) => seq,
            HandlerAction::CancelAll => "@cancel-all".to_string(),
            HandlerAction::Publish(event) => format!("@publish:{}", event),
        }
    }
}

/// Ordered actions triggered by an event, dispatched by priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    /// Event id this handler subscribes to
    pub event: String,
    /// Actions in execution order
    pub actions: Vec<HandlerAction>,
    /// Dispatch priority; higher runs first, ties break by handler id
    #[serde(default)]
    pub priority: i32,
    /// Drop events arriving within this window of the last dispatch
    #[serde(default)]
    pub debounce_ms: u64,
}

/// A parameterized producer of commands/sequences, expanded at load time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Template {
    /// Parameter names substituted into generated ids and bodies
    #[serde(default)]
    pub params: Vec<String>,
    /// Command bodies to stamp out per instance
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, Command>,
    /// Sequence bodies to stamp out per instance
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sequences: BTreeMap<String, Sequence>,
    /// One parameter map per expansion
    #[serde(default)]
    pub instances: Vec<BTreeMap<String, Scalar>>,
}

/// Value constraints applied to a command parameter at dispatch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamValidator {
    /// Inclusive numeric lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Closed set of acceptable rendered values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

/// Advisory unit metadata referenced by command parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Display symbol (`mL/min`)
    pub symbol: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named environment overlay selected per execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Variable overlay; shadows global `vars`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Scalar>,
    /// Transport option overrides (port, baud, …)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transport: BTreeMap<String, Scalar>,
}

/// Root of the loaded configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Document format version (`"1.1"`)
    pub version: String,
    /// Global variables, the outermost scope
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Scalar>,
    /// Environment overlays
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, Profile>,
    /// Context field declarations for expression typing
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, ContextDecl>,
    /// Device commands
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, Command>,
    /// Executable sequences
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sequences: BTreeMap<String, Sequence>,
    /// Named boolean expressions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, Condition>,
    /// Pre/post guards
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub guards: BTreeMap<String, Guard>,
    /// Retry/timeout policies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policies: BTreeMap<String, Policy>,
    /// Mutexes and semaphores
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Resource>,
    /// Event declarations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, Event>,
    /// Event handlers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub handlers: BTreeMap<String, Handler>,
    /// Load-time templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, Template>,
    /// Parameter value validators
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validators: BTreeMap<String, ParamValidator>,
    /// Advisory units
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, Unit>,
}

impl Configuration {
    /// Whether this document's version is one the engine accepts.
    pub fn version_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(&self.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_renders_whole_numbers_without_fraction() {
        assert_eq!(Scalar::Num(10.0).render(), "10");
        assert_eq!(Scalar::Num(2.5).render(), "2.5");
        assert_eq!(Scalar::Str("abc".into()).render(), "abc");
        assert_eq!(Scalar::Bool(true).render(), "true");
    }

    #[test]
    fn step_requires_exactly_one_discriminator() {
        let raw = RawStep::default();
        assert!(Step::try_from(raw).is_err());

        let both = RawStep {
            command: Some("ping".into()),
            wait: Some(1.0),
            ..RawStep::default()
        };
        assert!(Step::try_from(both).is_err());
    }

    #[test]
    fn step_toml_round_trip() {
        let toml_src = r#"
            steps = [
                { command = "ping" },
                { command = "set_flow", args = { rate = "{flow_rate}" } },
                { wait = 2.5 },
                { if = "alarm_clear" },
                { sequence = "flush" },
                { else = true },
                { parallel = ["a", "b"] },
                { endif = true },
            ]
        "#;
        let seq: Sequence = toml::from_str(toml_src).expect("steps parse");
        assert_eq!(seq.steps.len(), 8);
        assert_eq!(seq.steps[2], Step::Wait { seconds: 2.5 });
        assert_eq!(
            seq.steps[3],
            Step::If {
                condition: "alarm_clear".into()
            }
        );
        assert_eq!(seq.steps[5], Step::Else);

        let out = toml::to_string(&seq).expect("steps serialize");
        let back: Sequence = toml::from_str(&out).expect("round trip");
        assert_eq!(seq, back);
    }

    #[test]
    fn guard_action_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            on_fail: GuardAction,
        }
        let simple: Wrapper = toml::from_str(r#"on_fail = "abort""#).unwrap();
        assert_eq!(simple.on_fail, GuardAction::Abort);

        let comp: Wrapper =
            toml::from_str(r#"on_fail = { compensate = { sequence = "safe_stop" } }"#).unwrap();
        assert_eq!(
            comp.on_fail,
            GuardAction::Compensate {
                sequence: "safe_stop".into()
            }
        );
    }

    #[test]
    fn handler_action_strings() {
        assert_eq!(
            HandlerAction::try_from("safe_stop".to_string()).unwrap(),
            HandlerAction::Run("safe_stop".into())
        );
        assert_eq!(
            HandlerAction::try_from("@cancel-all".to_string()).unwrap(),
            HandlerAction::CancelAll
        );
        assert_eq!(
            HandlerAction::try_from("@publish:alarm".to_string()).unwrap(),
            HandlerAction::Publish("alarm".into())
        );
        assert!(HandlerAction::try_from("@bogus".to_string()).is_err());
    }

    #[test]
    fn resource_capacity() {
        let mutex = Resource::default();
        assert_eq!(mutex.capacity(), 1);

        let sem = Resource {
            kind: ResourceKind::Semaphore { permits: 3 },
            members: Vec::new(),
        };
        assert_eq!(sem.capacity(), 3);

        let membered = Resource {
            kind: ResourceKind::Semaphore { permits: 5 },
            members: vec!["a".into(), "b".into()],
        };
        assert_eq!(membered.capacity(), 2);
    }
}

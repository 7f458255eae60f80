// Settings schema and defaults

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root of `motto.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MottoSettings {
    /// Executor tuning
    #[serde(default)]
    pub engine: EngineSection,
    /// Event bus tuning
    #[serde(default)]
    pub events: EventsSection,
    /// Idempotency table tuning
    #[serde(default)]
    pub idempotency: IdempotencySection,
    /// Transport defaults
    #[serde(default)]
    pub transport: TransportSection,
    /// Configuration loader behavior
    #[serde(default)]
    pub loader: LoaderSection,
    /// Guard semantics knobs
    #[serde(default)]
    pub guards: GuardsSection,
}

impl Default for MottoSettings {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            events: EventsSection::default(),
            idempotency: IdempotencySection::default(),
            transport: TransportSection::default(),
            loader: LoaderSection::default(),
            guards: GuardsSection::default(),
        }
    }
}

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Sequence pool size; 0 means one worker per CPU core
    #[serde(default)]
    pub sequence_pool_size: usize,
    /// Nested sequence depth cap
    #[serde(default = "default_max_nested_depth")]
    pub max_nested_depth: u32,
    /// Wall-clock cap applied to sequences that declare none; 0 disables
    #[serde(default)]
    pub default_wall_clock_cap_ms: u64,
}

fn default_max_nested_depth() -> u32 {
    32
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            sequence_pool_size: 0,
            max_nested_depth: default_max_nested_depth(),
            default_wall_clock_cap_ms: 0,
        }
    }
}

/// Event bus tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsSection {
    /// Bounded queue length per handler; overflow drops the oldest
    #[serde(default = "default_handler_queue_capacity")]
    pub handler_queue_capacity: usize,
}

fn default_handler_queue_capacity() -> usize {
    64
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            handler_queue_capacity: default_handler_queue_capacity(),
        }
    }
}

/// Idempotency table tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySection {
    /// Entry time-to-live in milliseconds
    #[serde(default = "default_idempotency_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_idempotency_ttl_ms() -> u64 {
    300_000
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            ttl_ms: default_idempotency_ttl_ms(),
        }
    }
}

/// Transport defaults; profiles may override per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    /// Serial port path
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Response deadline for commands without a policy, milliseconds
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_deadline_ms() -> u64 {
    1_000
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            default_deadline_ms: default_deadline_ms(),
        }
    }
}

/// Configuration loader behavior.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoaderSection {
    /// Escalate unknown-key warnings to errors
    #[serde(default)]
    pub strict: bool,
}

/// Guard semantics knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardsSection {
    /// Run post-guards when the transport attempt itself timed out
    #[serde(default = "default_true")]
    pub run_post_guards_on_timeout: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GuardsSection {
    fn default() -> Self {
        Self {
            run_post_guards_on_timeout: default_true(),
        }
    }
}

/// Failures while loading or validating settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    /// File could not be read
    #[error("I/O error: {0}")]
    Io(String),
    /// TOML syntax or type error
    #[error("parse error: {0}")]
    Parse(String),
    /// A value is outside its documented range
    #[error("validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = MottoSettings::default();
        assert_eq!(settings.engine.max_nested_depth, 32);
        assert_eq!(settings.events.handler_queue_capacity, 64);
        assert_eq!(settings.idempotency.ttl_ms, 300_000);
        assert!(settings.guards.run_post_guards_on_timeout);
        assert!(!settings.loader.strict);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings: MottoSettings = toml::from_str(
            r#"
[events]
handler_queue_capacity = 8
"#,
        )
        .unwrap();
        assert_eq!(settings.events.handler_queue_capacity, 8);
        assert_eq!(settings.engine.max_nested_depth, 32);
    }
}

//! Runtime settings for the MOTTO orchestration engine
//!
//! Hosts configure the engine through `motto.toml` plus `MOTTO_*`
//! environment variables. These settings tune the runtime (pool sizes,
//! queue bounds, idempotency TTL, transport defaults); the orchestration
//! model itself (commands, sequences, guards, …) lives in its own
//! document and is loaded by `motto-engine`.
//!
//! Loading hierarchy: env > file > defaults.

mod config;
mod schema;

pub use config::{apply_env_overrides, load_from_path, load_settings, validate_settings};
pub use schema::{
    EngineSection, EventsSection, GuardsSection, IdempotencySection, LoaderSection,
    MottoSettings, SettingsError, TransportSection,
};

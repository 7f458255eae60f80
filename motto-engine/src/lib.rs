//! MOTTO orchestration core
//!
//! A TOML-defined engine that drives laboratory hardware through named
//! sequences of device commands under declarative safety rules. This
//! crate provides the complete core:
//! - Parses and validates the TOML configuration model
//! - Executes sequences with pre/post guards, retry policies, and
//!   fair mutex/semaphore resources
//! - Expands parameterized command and sequence templates at load time
//! - Publishes events to prioritized, debounced handlers
//! - Serializes every transport attempt so bytes never interleave
//!
//! The engine consumes a [`transport::Transport`] and a
//! [`clock::Clock`]; hosts interact through [`Orchestrator`].

pub mod audit;
pub mod clock;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod guard;
pub mod legacy;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod policy;
pub mod program;
pub mod resource;
pub mod template;
pub mod transport;
pub mod validator;

pub use audit::{AuditLog, AuditRecord};
pub use clock::{Clock, SysClock};
pub use context::{CorrelationId, ExecutionContext, StatusBoard};
pub use error::{ConfigError, ConfigErrorKind, EngineError, EngineResult};
pub use executor::{SequenceResult, SequenceStatus, StepResult, StepStatus};
pub use model::{Configuration, Scalar};
pub use orchestrator::{ExecutionHandle, Orchestrator, Snapshot};
pub use program::Program;
pub use transport::{Response, ScriptedTransport, Transport, TransportEvent, TransportLink};

//! Compiled program
//!
//! A [`Program`] is a configuration that passed validation, bundled with
//! everything precomputed at load time: compiled condition and filter
//! expressions, `if` block jump tables per sequence, and the handler
//! dispatch order per event. Executions hold an `Arc<Program>`, so a
//! reload never changes the model under a running sequence.

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::expr::{self, Expr};
use crate::model::Configuration;
use crate::validator::{self, BlockTable};

/// A validated configuration with its load-time artifacts.
pub struct Program {
    /// The validated configuration
    pub config: Configuration,
    /// Compiled condition expressions by condition id
    pub conditions: HashMap<String, Expr>,
    /// Compiled event filter expressions by event id
    pub filters: HashMap<String, Expr>,
    /// `if` block spans per sequence id
    pub blocks: HashMap<String, BlockTable>,
    /// Handler ids per event id, sorted by (priority desc, id asc)
    pub handler_order: HashMap<String, Vec<String>>,
}

impl Program {
    /// Validate and compile a configuration.
    ///
    /// Returns every validation defect at once; compilation itself
    /// cannot fail for a model that validated (expressions were already
    /// compiled during type-checking).
    pub fn compile(config: Configuration) -> Result<Self, Vec<ConfigError>> {
        let errors = validator::validate(&config);
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut conditions = HashMap::new();
        for (id, condition) in &config.conditions {
            let compiled = expr::compile(&condition.expr).expect("validated condition compiles");
            conditions.insert(id.clone(), compiled);
        }

        let mut filters = HashMap::new();
        for (id, event) in &config.events {
            let compiled = expr::compile(&event.filter).expect("validated filter compiles");
            filters.insert(id.clone(), compiled);
        }

        let mut blocks = HashMap::new();
        for (id, sequence) in &config.sequences {
            let table = validator::analyze_blocks(&sequence.steps)
                .expect("validated sequence has balanced blocks");
            blocks.insert(id.clone(), table);
        }

        let mut handler_order: HashMap<String, Vec<String>> = HashMap::new();
        for (handler_id, handler) in &config.handlers {
            handler_order
                .entry(handler.event.clone())
                .or_default()
                .push(handler_id.clone());
        }
        for order in handler_order.values_mut() {
            order.sort_by(|a, b| {
                let pa = config.handlers[a].priority;
                let pb = config.handlers[b].priority;
                pb.cmp(&pa).then_with(|| a.cmp(b))
            });
        }

        Ok(Self {
            config,
            conditions,
            filters,
            blocks,
            handler_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn compile(doc: &str) -> Program {
        let loaded = parser::load(doc.as_bytes(), false).expect("parses");
        Program::compile(loaded.config).expect("validates")
    }

    #[test]
    fn handler_order_is_priority_desc_then_id_asc() {
        let program = compile(
            r#"
version = "1.1"

[commands.stop]
line = "STOP"

[sequences.safe_stop]
steps = [ { command = "stop" } ]

[events.alarm]
source = "transport"

[handlers.h_lo]
event = "alarm"
actions = ["safe_stop"]
priority = 1

[handlers.h_hi]
event = "alarm"
actions = ["safe_stop"]
priority = 100

[handlers.a_hi]
event = "alarm"
actions = ["safe_stop"]
priority = 100
"#,
        );
        assert_eq!(
            program.handler_order["alarm"],
            vec!["a_hi".to_string(), "h_hi".to_string(), "h_lo".to_string()]
        );
    }

    #[test]
    fn invalid_model_does_not_compile() {
        let loaded = parser::load(
            br#"
version = "1.1"

[sequences.s]
steps = [ { command = "ghost" } ]
"#,
            false,
        )
        .expect("parses");
        assert!(Program::compile(loaded.config).is_err());
    }

    #[test]
    fn block_tables_are_prepared_per_sequence() {
        let program = compile(
            r#"
version = "1.1"

[commands.a]
line = "A"

[conditions.c]
expr = "true"

[sequences.s]
steps = [
    { if = "c" },
    { command = "a" },
    { endif = true },
]
"#,
        );
        let table = &program.blocks["s"];
        assert_eq!(table[&0].endif_index, 2);
    }
}

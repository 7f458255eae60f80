//! Legacy configuration migration
//!
//! One-shot transform of the old flat button/sequence table format into
//! a core v1.1 configuration. Buttons become commands plus single-step
//! sequences (one per button, so hosts can keep triggering them by
//! name); flat sequence lists become step lists, with declared
//! `delay_after` values turned into `wait` steps. The output is
//! canonical TOML that loads through the normal parser path; there is no
//! runtime adapter.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigErrorKind};
use crate::model::{Command, Configuration, Sequence, Step};
use crate::parser;

/// One legacy button: a label and a raw device line.
#[derive(Debug, Clone, Deserialize)]
struct LegacyButton {
    /// Display label; carried into the sequence description
    #[serde(default)]
    label: Option<String>,
    /// Raw ASCII line the button sent
    command: String,
    /// Seconds the old runner paused after this button
    #[serde(default)]
    delay_after: Option<f64>,
}

/// The legacy flat document.
#[derive(Debug, Clone, Default, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    buttons: BTreeMap<String, LegacyButton>,
    /// Sequence name → ordered button names
    #[serde(default)]
    sequences: BTreeMap<String, Vec<String>>,
}

/// Transform legacy flat TOML into canonical core TOML.
///
/// Every defect is collected; the transform succeeds only when the
/// produced configuration would load cleanly.
pub fn migrate(legacy_bytes: &[u8]) -> Result<String, Vec<ConfigError>> {
    let text = std::str::from_utf8(legacy_bytes).map_err(|e| {
        vec![ConfigError::new(
            "<legacy>",
            ConfigErrorKind::Syntax,
            format!("not valid UTF-8: {}", e),
        )]
    })?;
    let legacy: LegacyConfig = toml::from_str(text).map_err(|e| {
        vec![ConfigError::new(
            "<legacy>",
            ConfigErrorKind::Syntax,
            e.to_string(),
        )]
    })?;

    let mut errors = Vec::new();
    let mut config = Configuration {
        version: "1.1".to_string(),
        vars: BTreeMap::new(),
        profiles: BTreeMap::new(),
        contexts: BTreeMap::new(),
        commands: BTreeMap::new(),
        sequences: BTreeMap::new(),
        conditions: BTreeMap::new(),
        guards: BTreeMap::new(),
        policies: BTreeMap::new(),
        resources: BTreeMap::new(),
        events: BTreeMap::new(),
        handlers: BTreeMap::new(),
        templates: BTreeMap::new(),
        validators: BTreeMap::new(),
        units: BTreeMap::new(),
    };

    for (button_id, button) in &legacy.buttons {
        config.commands.insert(
            button_id.clone(),
            Command {
                line: button.command.clone(),
                params: Vec::new(),
                defaults: BTreeMap::new(),
                units: BTreeMap::new(),
                validators: BTreeMap::new(),
                expect: None,
            },
        );

        // One single-step sequence per button keeps the old
        // press-by-name surface working.
        let mut steps = vec![Step::Command {
            command: button_id.clone(),
            args: BTreeMap::new(),
            lets: BTreeMap::new(),
        }];
        if let Some(delay) = button.delay_after {
            if delay > 0.0 {
                steps.push(Step::Wait { seconds: delay });
            }
        }
        if legacy.sequences.contains_key(button_id) {
            errors.push(ConfigError::new(
                format!("buttons.{}", button_id),
                ConfigErrorKind::DuplicateId,
                format!("button '{}' collides with a legacy sequence of the same name", button_id),
            ));
            continue;
        }
        config.sequences.insert(
            button_id.clone(),
            Sequence {
                steps,
                description: button.label.clone(),
                ..Sequence::default()
            },
        );
    }

    for (sequence_id, button_refs) in &legacy.sequences {
        let mut steps = Vec::new();
        for (index, button_id) in button_refs.iter().enumerate() {
            let Some(button) = legacy.buttons.get(button_id) else {
                errors.push(ConfigError::new(
                    format!("sequences.{}[{}]", sequence_id, index),
                    ConfigErrorKind::UnknownRef,
                    format!("button '{}' does not exist", button_id),
                ));
                continue;
            };
            steps.push(Step::Command {
                command: button_id.clone(),
                args: BTreeMap::new(),
                lets: BTreeMap::new(),
            });
            if let Some(delay) = button.delay_after {
                if delay > 0.0 {
                    steps.push(Step::Wait { seconds: delay });
                }
            }
        }
        config.sequences.insert(
            sequence_id.clone(),
            Sequence {
                steps,
                ..Sequence::default()
            },
        );
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let canonical = parser::canonical(&config).map_err(|e| vec![e])?;

    // The transform must produce a document the normal path accepts.
    parser::load(canonical.as_bytes(), true)?;
    Ok(canonical)
}

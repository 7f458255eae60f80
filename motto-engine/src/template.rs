//! Template expansion and placeholder rendering
//!
//! Two distinct substitution points share the `{name}` syntax:
//!
//! - **Load time**: `templates` are expanded into concrete commands and
//!   sequences, one copy per instance, as a pure function of the template
//!   body and the instance parameters. Placeholders that are not template
//!   parameters survive untouched so that runtime parameters stay in the
//!   generated bodies.
//! - **Dispatch time**: the rendered command line substitutes `{param}`
//!   from the effective variable scope; a placeholder nothing resolves is
//!   a `ParamMissing` step failure.

use std::collections::BTreeMap;

use crate::error::{ConfigError, ConfigErrorKind};
use crate::model::{Command, Configuration, Scalar, Sequence, Step};

/// Extract placeholder names from a line template, in order of first
/// appearance. Names are `[A-Za-z0-9_]+`; malformed braces are literal.
pub fn placeholders(line: &str) -> Vec<String> {
    let mut names = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = find_placeholder_end(bytes, i + 1) {
                let name = &line[i + 1..end];
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    names
}

fn find_placeholder_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'}' => return if i > start { Some(i) } else { None },
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => i += 1,
            _ => return None,
        }
    }
    None
}

/// Substitute every placeholder through `resolve`; the first placeholder
/// that resolves to `None` aborts with its name.
pub fn render(line: &str, resolve: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(line.len());
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = find_placeholder_end(bytes, i + 1) {
                let name = &line[i + 1..end];
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => return Err(name.to_string()),
                }
                i = end + 1;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    Ok(out)
}

/// Substitute only the placeholders present in `params`, leaving every
/// other placeholder literal. Used at template expansion time.
pub fn render_partial(text: &str, params: &BTreeMap<String, Scalar>) -> String {
    render(text, |name| {
        params.get(name).map(|v| v.render()).or_else(|| Some(format!("{{{}}}", name)))
    })
    .expect("partial rendering always resolves")
}

/// Expand every template in the configuration into concrete commands and
/// sequences, consuming the `templates` section. Generated ids collide
/// with existing ids as a defect; instances missing a declared parameter
/// are a defect. Expansion is deterministic: instances are applied in
/// declared order, and the canonical serialized form carries only the
/// expanded entities.
pub fn expand_templates(config: &mut Configuration) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let templates = std::mem::take(&mut config.templates);

    for (template_id, template) in &templates {
        for (index, instance) in template.instances.iter().enumerate() {
            let path = format!("templates.{}.instances[{}]", template_id, index);

            let mut missing = Vec::new();
            for param in &template.params {
                if !instance.contains_key(param) {
                    missing.push(param.clone());
                }
            }
            if !missing.is_empty() {
                errors.push(ConfigError::new(
                    path.clone(),
                    ConfigErrorKind::MissingParam,
                    format!("instance misses parameter(s): {}", missing.join(", ")),
                ));
                continue;
            }

            for (id_template, command) in &template.commands {
                let id = render_partial(id_template, instance);
                let expanded = expand_command(command, instance);
                if config.commands.insert(id.clone(), expanded).is_some() {
                    errors.push(ConfigError::new(
                        path.clone(),
                        ConfigErrorKind::DuplicateId,
                        format!("expanded command id '{}' already exists", id),
                    ));
                }
            }

            for (id_template, sequence) in &template.sequences {
                let id = render_partial(id_template, instance);
                let expanded = expand_sequence(sequence, instance);
                if config.sequences.insert(id.clone(), expanded).is_some() {
                    errors.push(ConfigError::new(
                        path.clone(),
                        ConfigErrorKind::DuplicateId,
                        format!("expanded sequence id '{}' already exists", id),
                    ));
                }
            }
        }
    }

    errors
}

fn expand_command(command: &Command, params: &BTreeMap<String, Scalar>) -> Command {
    let mut out = command.clone();
    out.line = render_partial(&command.line, params);
    out
}

fn expand_sequence(sequence: &Sequence, params: &BTreeMap<String, Scalar>) -> Sequence {
    let mut out = sequence.clone();
    out.steps = sequence
        .steps
        .iter()
        .map(|step| expand_step(step, params))
        .collect();
    out
}

fn expand_step(step: &Step, params: &BTreeMap<String, Scalar>) -> Step {
    match step {
        Step::Command { command, args, lets } => Step::Command {
            command: render_partial(command, params),
            args: args
                .iter()
                .map(|(k, v)| (k.clone(), render_partial(v, params)))
                .collect(),
            lets: lets.clone(),
        },
        Step::Sequence { sequence } => Step::Sequence {
            sequence: render_partial(sequence, params),
        },
        Step::Parallel { branches } => Step::Parallel {
            branches: branches.iter().map(|b| render_partial(b, params)).collect(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Template;

    #[test]
    fn extracts_placeholders_in_order() {
        assert_eq!(placeholders("FLOW {rate} {rate} {unit}"), vec!["rate", "unit"]);
        assert_eq!(placeholders("PING"), Vec::<String>::new());
        // Malformed braces stay literal.
        assert_eq!(placeholders("A { b } {c"), Vec::<String>::new());
    }

    #[test]
    fn render_reports_first_missing_param() {
        let result = render("MOVE {x} {y}", |name| {
            (name == "x").then(|| "10".to_string())
        });
        assert_eq!(result, Err("y".to_string()));
    }

    #[test]
    fn render_partial_leaves_unknown_placeholders() {
        let mut params = BTreeMap::new();
        params.insert("n".to_string(), Scalar::Num(2.0));
        assert_eq!(render_partial("OPEN {n} {rate}", &params), "OPEN 2 {rate}");
    }

    #[test]
    fn expands_template_instances_into_commands() {
        let mut config = Configuration {
            version: "1.1".into(),
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

        let mut commands = BTreeMap::new();
        commands.insert(
            "valve_{n}_open".to_string(),
            Command {
                line: "OPEN {n} {rate}".to_string(),
                params: vec!["rate".to_string()],
                defaults: BTreeMap::new(),
                units: BTreeMap::new(),
                validators: BTreeMap::new(),
                expect: None,
            },
        );
        let mut instance_a = BTreeMap::new();
        instance_a.insert("n".to_string(), Scalar::Num(1.0));
        let mut instance_b = BTreeMap::new();
        instance_b.insert("n".to_string(), Scalar::Num(2.0));

        config.templates.insert(
            "valves".to_string(),
            Template {
                params: vec!["n".to_string()],
                commands,
                sequences: BTreeMap::new(),
                instances: vec![instance_a, instance_b],
            },
        );

        let errors = expand_templates(&mut config);
        assert!(errors.is_empty(), "unexpected: {:?}", errors);
        assert_eq!(config.commands.len(), 2);
        assert_eq!(config.commands["valve_1_open"].line, "OPEN 1 {rate}");
        assert_eq!(config.commands["valve_2_open"].line, "OPEN 2 {rate}");
    }

    #[test]
    fn missing_instance_parameter_is_a_defect() {
        let mut config: Configuration = toml::from_str(r#"version = "1.1""#).unwrap();
        config.templates.insert(
            "t".to_string(),
            Template {
                params: vec!["n".to_string()],
                commands: BTreeMap::new(),
                sequences: BTreeMap::new(),
                instances: vec![BTreeMap::new()],
            },
        );
        let errors = expand_templates(&mut config);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ConfigErrorKind::MissingParam);
    }
}

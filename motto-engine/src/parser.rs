//! Configuration loader
//!
//! Turns TOML bytes into a typed [`Configuration`]: syntax, version gate,
//! unknown-key scan (warnings by default, errors under strict mode), typed
//! deserialization, and load-time template expansion. No expression is
//! evaluated here; conditions and filters are compiled and typed by the
//! validator.

use crate::error::{ConfigError, ConfigErrorKind};
use crate::model::{Configuration, SUPPORTED_VERSIONS};
use crate::template;

/// A successfully loaded configuration plus non-fatal findings.
#[derive(Debug, Clone)]
pub struct Loaded {
    /// The typed, template-expanded configuration
    pub config: Configuration,
    /// Unknown-key findings (empty under strict mode, which escalates
    /// them to errors)
    pub warnings: Vec<ConfigError>,
}

/// Parse configuration bytes.
///
/// All defects found at this stage are returned together; the document is
/// rejected as a whole if any error (as opposed to warning) is present.
pub fn load(bytes: &[u8], strict: bool) -> Result<Loaded, Vec<ConfigError>> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        vec![ConfigError::new(
            "<document>",
            ConfigErrorKind::Syntax,
            format!("not valid UTF-8: {}", e),
        )]
    })?;

    let raw: toml::Value = toml::from_str(text).map_err(|e| {
        vec![ConfigError::new(
            "<document>",
            ConfigErrorKind::Syntax,
            e.to_string(),
        )]
    })?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_version(&raw, &mut errors);
    scan_unknown_keys(&raw, strict, &mut errors, &mut warnings);

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut config: Configuration = raw.try_into().map_err(|e: toml::de::Error| {
        vec![ConfigError::new(
            "<document>",
            ConfigErrorKind::Syntax,
            e.to_string(),
        )]
    })?;

    let expansion_errors = template::expand_templates(&mut config);
    if !expansion_errors.is_empty() {
        return Err(expansion_errors);
    }

    Ok(Loaded { config, warnings })
}

/// Serialize a configuration to its canonical TOML form.
///
/// Unordered sections are `BTreeMap`s, so the output is byte-stable:
/// loading the canonical form and serializing it again reproduces the
/// same bytes.
pub fn canonical(config: &Configuration) -> Result<String, ConfigError> {
    toml::to_string(config).map_err(|e| {
        ConfigError::new("<document>", ConfigErrorKind::Syntax, e.to_string())
    })
}

fn check_version(raw: &toml::Value, errors: &mut Vec<ConfigError>) {
    match raw.get("version").and_then(|v| v.as_str()) {
        Some(version) if SUPPORTED_VERSIONS.contains(&version) => {}
        Some(version) => errors.push(ConfigError::new(
            "version",
            ConfigErrorKind::Version,
            format!(
                "unsupported version '{}', expected one of: {}",
                version,
                SUPPORTED_VERSIONS.join(", ")
            ),
        )),
        None => errors.push(ConfigError::new(
            "version",
            ConfigErrorKind::Version,
            "missing required string key 'version'",
        )),
    }
}

// --- unknown-key scan ---

const ROOT_KEYS: &[&str] = &[
    "version", "vars", "profiles", "contexts", "commands", "sequences", "conditions", "guards",
    "policies", "resources", "events", "handlers", "templates", "validators", "units",
];
const COMMAND_KEYS: &[&str] = &["line", "params", "defaults", "units", "validators", "expect"];
const SEQUENCE_KEYS: &[&str] = &[
    "steps",
    "policy",
    "guards",
    "resources",
    "on_error",
    "wall_clock_cap_ms",
    "description",
];
const STEP_KEYS: &[&str] = &[
    "command", "args", "let", "sequence", "wait", "if", "else", "endif", "parallel",
];
const CONDITION_KEYS: &[&str] = &["expr", "context"];
const GUARD_KEYS: &[&str] = &["when", "condition", "on_fail"];
const POLICY_KEYS: &[&str] = &["max_attempts", "backoff", "timeout_ms", "idempotency_key"];
const RESOURCE_KEYS: &[&str] = &["kind", "members"];
const EVENT_KEYS: &[&str] = &["source", "filter", "payload", "context", "every_ms"];
const HANDLER_KEYS: &[&str] = &["event", "actions", "priority", "debounce_ms"];
const TEMPLATE_KEYS: &[&str] = &["params", "commands", "sequences", "instances"];
const VALIDATOR_KEYS: &[&str] = &["min", "max", "allowed"];
const UNIT_KEYS: &[&str] = &["symbol", "description"];
const PROFILE_KEYS: &[&str] = &["vars", "transport"];
const CONTEXT_KEYS: &[&str] = &["fields"];

fn scan_unknown_keys(
    raw: &toml::Value,
    strict: bool,
    errors: &mut Vec<ConfigError>,
    warnings: &mut Vec<ConfigError>,
) {
    let Some(root) = raw.as_table() else { return };

    let mut report = |path: String, key: &str| {
        let finding = ConfigError::new(
            path,
            ConfigErrorKind::UnknownKey,
            format!("unrecognized key '{}'", key),
        );
        if strict {
            errors.push(finding);
        } else {
            warnings.push(finding);
        }
    };

    for key in root.keys() {
        if !ROOT_KEYS.contains(&key.as_str()) {
            report(key.clone(), key);
        }
    }

    scan_section(root, "commands", COMMAND_KEYS, &mut report);
    scan_section(root, "conditions", CONDITION_KEYS, &mut report);
    scan_section(root, "guards", GUARD_KEYS, &mut report);
    scan_section(root, "policies", POLICY_KEYS, &mut report);
    scan_section(root, "resources", RESOURCE_KEYS, &mut report);
    scan_section(root, "events", EVENT_KEYS, &mut report);
    scan_section(root, "handlers", HANDLER_KEYS, &mut report);
    scan_section(root, "validators", VALIDATOR_KEYS, &mut report);
    scan_section(root, "units", UNIT_KEYS, &mut report);
    scan_section(root, "profiles", PROFILE_KEYS, &mut report);
    scan_section(root, "contexts", CONTEXT_KEYS, &mut report);

    scan_sequences(root.get("sequences"), "sequences", &mut report);

    if let Some(templates) = root.get("templates").and_then(|v| v.as_table()) {
        for (id, body) in templates {
            let base = format!("templates.{}", id);
            if let Some(table) = body.as_table() {
                for key in table.keys() {
                    if !TEMPLATE_KEYS.contains(&key.as_str()) {
                        report(format!("{}.{}", base, key), key);
                    }
                }
                if let Some(commands) = table.get("commands").and_then(|v| v.as_table()) {
                    for (cmd_id, cmd) in commands {
                        scan_keys(
                            cmd,
                            &format!("{}.commands.{}", base, cmd_id),
                            COMMAND_KEYS,
                            &mut report,
                        );
                    }
                }
                scan_sequences(table.get("sequences"), &format!("{}.sequences", base), &mut report);
            }
        }
    }
}

fn scan_section(
    root: &toml::map::Map<String, toml::Value>,
    section: &str,
    known: &[&str],
    report: &mut impl FnMut(String, &str),
) {
    if let Some(entities) = root.get(section).and_then(|v| v.as_table()) {
        for (id, body) in entities {
            scan_keys(body, &format!("{}.{}", section, id), known, report);
        }
    }
}

fn scan_keys(
    value: &toml::Value,
    path: &str,
    known: &[&str],
    report: &mut impl FnMut(String, &str),
) {
    if let Some(table) = value.as_table() {
        for key in table.keys() {
            if !known.contains(&key.as_str()) {
                report(format!("{}.{}", path, key), key);
            }
        }
    }
}

fn scan_sequences(
    sequences: Option<&toml::Value>,
    base: &str,
    report: &mut impl FnMut(String, &str),
) {
    let Some(sequences) = sequences.and_then(|v| v.as_table()) else {
        return;
    };
    for (id, body) in sequences {
        let seq_path = format!("{}.{}", base, id);
        scan_keys(body, &seq_path, SEQUENCE_KEYS, report);
        if let Some(steps) = body.get("steps").and_then(|v| v.as_array()) {
            for (index, step) in steps.iter().enumerate() {
                scan_keys(
                    step,
                    &format!("{}.steps[{}]", seq_path, index),
                    STEP_KEYS,
                    report,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    const MINIMAL: &str = r#"
version = "1.1"

[commands.ping]
line = "PING"

[sequences.s]
steps = [ { command = "ping" } ]
"#;

    #[test]
    fn loads_minimal_document() {
        let loaded = load(MINIMAL.as_bytes(), false).expect("loads");
        assert!(loaded.warnings.is_empty());
        assert_eq!(loaded.config.commands["ping"].line, "PING");
        assert_eq!(
            loaded.config.sequences["s"].steps[0],
            Step::Command {
                command: "ping".into(),
                args: Default::default(),
                lets: Default::default(),
            }
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let doc = MINIMAL.replace("1.1", "9.9");
        let errors = load(doc.as_bytes(), false).unwrap_err();
        assert_eq!(errors[0].kind, ConfigErrorKind::Version);
    }

    #[test]
    fn rejects_missing_version() {
        let errors = load(b"[commands.ping]\nline = \"PING\"\n", false).unwrap_err();
        assert_eq!(errors[0].kind, ConfigErrorKind::Version);
    }

    #[test]
    fn unknown_keys_warn_by_default_and_fail_strict() {
        let doc = format!("{}\n[commands.ping2]\nline = \"PING\"\nbaud = 9600\n", MINIMAL);

        let loaded = load(doc.as_bytes(), false).expect("lenient load succeeds");
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.warnings[0].kind, ConfigErrorKind::UnknownKey);
        assert!(loaded.warnings[0].path.contains("commands.ping2"));

        let errors = load(doc.as_bytes(), true).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ConfigErrorKind::UnknownKey);
    }

    #[test]
    fn duplicate_ids_rejected_by_toml_syntax() {
        let doc = r#"
version = "1.1"
[commands.ping]
line = "PING"
[commands.ping]
line = "PING2"
"#;
        let errors = load(doc.as_bytes(), false).unwrap_err();
        assert_eq!(errors[0].kind, ConfigErrorKind::Syntax);
    }

    #[test]
    fn canonical_form_is_byte_stable() {
        let loaded = load(MINIMAL.as_bytes(), false).expect("loads");
        let first = canonical(&loaded.config).expect("serializes");
        let reloaded = load(first.as_bytes(), false).expect("canonical reloads");
        let second = canonical(&reloaded.config).expect("serializes again");
        assert_eq!(first, second);
    }

    #[test]
    fn template_expansion_happens_at_load() {
        let doc = r#"
version = "1.1"

[templates.valves]
params = ["n"]
instances = [ { n = 1 }, { n = 2 } ]

[templates.valves.commands."valve_{n}_open"]
line = "OPEN {n}"
"#;
        let loaded = load(doc.as_bytes(), false).expect("loads");
        assert_eq!(loaded.config.commands["valve_1_open"].line, "OPEN 1");
        assert_eq!(loaded.config.commands["valve_2_open"].line, "OPEN 2");

        // The canonical form carries the expanded entities only, so it
        // reloads without re-expansion collisions.
        assert!(loaded.config.templates.is_empty());
        let canon = canonical(&loaded.config).expect("serializes");
        let reloaded = load(canon.as_bytes(), true).expect("canonical reloads");
        assert_eq!(reloaded.config.commands.len(), 2);
    }
}

//! Static validation of a loaded configuration
//!
//! Runs after parsing and before any execution. Every check collects its
//! violations into one list; validation never stops at the first defect.
//! Checks: reference closure, `if`/`else`/`endif` balance, cycle freedom,
//! parallel resource safety, parameter completeness, expression typing,
//! and numeric ranges.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{ConfigError, ConfigErrorKind};
use crate::expr;
use crate::model::{
    Configuration, FieldType, GuardAction, HandlerAction, ResourceKind, Step, TRANSPORT_RESOURCE,
};

/// Span of one `if` block inside a step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Index of the `else` marker, if present
    pub else_index: Option<usize>,
    /// Index of the matching `endif`
    pub endif_index: usize,
}

/// `if` step index → its block span, for one sequence.
pub type BlockTable = BTreeMap<usize, Block>;

/// Validate the whole model; an empty list means the model is executable.
pub fn validate(config: &Configuration) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    check_commands(config, &mut errors);
    check_conditions(config, &mut errors);
    check_guards(config, &mut errors);
    check_policies(config, &mut errors);
    check_resources(config, &mut errors);
    check_events(config, &mut errors);
    check_handlers(config, &mut errors);
    check_sequences(config, &mut errors);
    check_cycles(config, &mut errors);
    check_parallel_resources(config, &mut errors);

    errors
}

/// Compute the block table for a step list, or the defects that prevent
/// one. Shared with the executor, which uses the table to jump over
/// untaken branches.
pub fn analyze_blocks(steps: &[Step]) -> Result<BlockTable, Vec<(usize, String)>> {
    let mut table = BlockTable::new();
    let mut stack: Vec<(usize, Option<usize>)> = Vec::new();
    let mut defects = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        match step {
            Step::If { .. } => stack.push((index, None)),
            Step::Else => match stack.last_mut() {
                Some((_, else_slot)) if else_slot.is_none() => *else_slot = Some(index),
                Some(_) => defects.push((index, "second 'else' in one 'if' block".to_string())),
                None => defects.push((index, "'else' outside any 'if' block".to_string())),
            },
            Step::EndIf => match stack.pop() {
                Some((if_index, else_index)) => {
                    table.insert(
                        if_index,
                        Block {
                            else_index,
                            endif_index: index,
                        },
                    );
                }
                None => defects.push((index, "'endif' outside any 'if' block".to_string())),
            },
            _ => {}
        }
    }

    for (if_index, _) in stack {
        defects.push((if_index, "'if' without matching 'endif'".to_string()));
    }

    if defects.is_empty() {
        Ok(table)
    } else {
        Err(defects)
    }
}

fn check_commands(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, command) in &config.commands {
        let path = format!("commands.{}", id);

        for placeholder in crate::template::placeholders(&command.line) {
            if !command.params.contains(&placeholder) {
                errors.push(ConfigError::new(
                    format!("{}.line", path),
                    ConfigErrorKind::MissingParam,
                    format!("placeholder '{{{}}}' is not a declared parameter", placeholder),
                ));
            }
        }

        for param in command.defaults.keys() {
            if !command.params.contains(param) {
                errors.push(ConfigError::new(
                    format!("{}.defaults", path),
                    ConfigErrorKind::UnknownRef,
                    format!("default for undeclared parameter '{}'", param),
                ));
            }
        }

        for (param, unit) in &command.units {
            if !command.params.contains(param) {
                errors.push(ConfigError::new(
                    format!("{}.units", path),
                    ConfigErrorKind::UnknownRef,
                    format!("unit for undeclared parameter '{}'", param),
                ));
            }
            if !config.units.contains_key(unit) {
                errors.push(ConfigError::new(
                    format!("{}.units.{}", path, param),
                    ConfigErrorKind::UnknownRef,
                    format!("unit '{}' does not exist", unit),
                ));
            }
        }

        for (param, validator) in &command.validators {
            if !command.params.contains(param) {
                errors.push(ConfigError::new(
                    format!("{}.validators", path),
                    ConfigErrorKind::UnknownRef,
                    format!("validator for undeclared parameter '{}'", param),
                ));
            }
            if !config.validators.contains_key(validator) {
                errors.push(ConfigError::new(
                    format!("{}.validators.{}", path, param),
                    ConfigErrorKind::UnknownRef,
                    format!("validator '{}' does not exist", validator),
                ));
            }
        }
    }
}

fn context_fields(
    config: &Configuration,
    context: Option<&String>,
    path: &str,
    errors: &mut Vec<ConfigError>,
) -> BTreeMap<String, FieldType> {
    match context {
        None => BTreeMap::new(),
        Some(ctx_id) => match config.contexts.get(ctx_id) {
            Some(decl) => decl.fields.clone(),
            None => {
                errors.push(ConfigError::new(
                    path.to_string(),
                    ConfigErrorKind::UnknownRef,
                    format!("context '{}' does not exist", ctx_id),
                ));
                BTreeMap::new()
            }
        },
    }
}

fn require_boolean(
    source: &str,
    fields: &BTreeMap<String, FieldType>,
    path: &str,
    errors: &mut Vec<ConfigError>,
) {
    match expr::compile(source) {
        Err(e) => errors.push(ConfigError::new(
            path.to_string(),
            ConfigErrorKind::TypeError,
            e.to_string(),
        )),
        Ok(compiled) => match expr::type_check(&compiled, fields) {
            Ok(FieldType::Bool) => {}
            Ok(other) => errors.push(ConfigError::new(
                path.to_string(),
                ConfigErrorKind::TypeError,
                format!("expression must be boolean, found {:?}", other),
            )),
            Err(e) => errors.push(ConfigError::new(
                path.to_string(),
                ConfigErrorKind::TypeError,
                e.to_string(),
            )),
        },
    }
}

fn check_conditions(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, condition) in &config.conditions {
        let path = format!("conditions.{}", id);
        let fields = context_fields(
            config,
            condition.context.as_ref(),
            &format!("{}.context", path),
            errors,
        );
        require_boolean(&condition.expr, &fields, &format!("{}.expr", path), errors);
    }
}

fn check_guards(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, guard) in &config.guards {
        let path = format!("guards.{}", id);
        if !config.conditions.contains_key(&guard.condition) {
            errors.push(ConfigError::new(
                format!("{}.condition", path),
                ConfigErrorKind::UnknownRef,
                format!("condition '{}' does not exist", guard.condition),
            ));
        }
        if let GuardAction::Compensate { sequence } = &guard.on_fail {
            if !config.sequences.contains_key(sequence) {
                errors.push(ConfigError::new(
                    format!("{}.on_fail", path),
                    ConfigErrorKind::UnknownRef,
                    format!("compensation sequence '{}' does not exist", sequence),
                ));
            }
        }
    }
}

fn check_policies(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, policy) in &config.policies {
        let path = format!("policies.{}", id);
        if policy.max_attempts < 1 {
            errors.push(ConfigError::new(
                format!("{}.max_attempts", path),
                ConfigErrorKind::Range,
                "max_attempts must be >= 1",
            ));
        }
        if policy.timeout_ms == 0 {
            errors.push(ConfigError::new(
                format!("{}.timeout_ms", path),
                ConfigErrorKind::Range,
                "timeout_ms must be > 0",
            ));
        }
    }
}

fn check_resources(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, resource) in &config.resources {
        let path = format!("resources.{}", id);
        if id == TRANSPORT_RESOURCE {
            errors.push(ConfigError::new(
                path.clone(),
                ConfigErrorKind::ResourceConflict,
                format!("'{}' is the built-in transport mutex and cannot be redefined", id),
            ));
        }
        if let ResourceKind::Semaphore { permits } = resource.kind {
            if permits < 1 {
                errors.push(ConfigError::new(
                    format!("{}.kind", path),
                    ConfigErrorKind::Range,
                    "semaphore permits must be >= 1",
                ));
            }
        }
    }
}

fn check_events(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, event) in &config.events {
        let path = format!("events.{}", id);
        let mut fields = context_fields(
            config,
            event.context.as_ref(),
            &format!("{}.context", path),
            errors,
        );
        fields.extend(event.payload.iter().map(|(k, v)| (k.clone(), *v)));
        require_boolean(&event.filter, &fields, &format!("{}.filter", path), errors);

        if event.every_ms == Some(0) {
            errors.push(ConfigError::new(
                format!("{}.every_ms", path),
                ConfigErrorKind::Range,
                "every_ms must be > 0",
            ));
        }
    }
}

fn check_handlers(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, handler) in &config.handlers {
        let path = format!("handlers.{}", id);
        if !config.events.contains_key(&handler.event) {
            errors.push(ConfigError::new(
                format!("{}.event", path),
                ConfigErrorKind::UnknownRef,
                format!("event '{}' does not exist", handler.event),
            ));
        }
        for (index, action) in handler.actions.iter().enumerate() {
            let action_path = format!("{}.actions[{}]", path, index);
            match action {
                HandlerAction::Run(sequence) => {
                    if !config.sequences.contains_key(sequence) {
                        errors.push(ConfigError::new(
                            action_path,
                            ConfigErrorKind::UnknownRef,
                            format!("sequence '{}' does not exist", sequence),
                        ));
                    }
                }
                HandlerAction::Publish(event) => {
                    if !config.events.contains_key(event) {
                        errors.push(ConfigError::new(
                            action_path,
                            ConfigErrorKind::UnknownRef,
                            format!("event '{}' does not exist", event),
                        ));
                    }
                }
                HandlerAction::CancelAll => {}
            }
        }
    }
}

fn check_sequences(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (id, sequence) in &config.sequences {
        let path = format!("sequences.{}", id);

        if let Some(policy) = &sequence.policy {
            if !config.policies.contains_key(policy) {
                errors.push(ConfigError::new(
                    format!("{}.policy", path),
                    ConfigErrorKind::UnknownRef,
                    format!("policy '{}' does not exist", policy),
                ));
            }
        }
        for guard in &sequence.guards {
            if !config.guards.contains_key(guard) {
                errors.push(ConfigError::new(
                    format!("{}.guards", path),
                    ConfigErrorKind::UnknownRef,
                    format!("guard '{}' does not exist", guard),
                ));
            }
        }
        for resource in &sequence.resources {
            if resource != TRANSPORT_RESOURCE && !config.resources.contains_key(resource) {
                errors.push(ConfigError::new(
                    format!("{}.resources", path),
                    ConfigErrorKind::UnknownRef,
                    format!("resource '{}' does not exist", resource),
                ));
            }
        }
        if let Some(GuardAction::Compensate { sequence: comp }) = &sequence.on_error {
            if !config.sequences.contains_key(comp) {
                errors.push(ConfigError::new(
                    format!("{}.on_error", path),
                    ConfigErrorKind::UnknownRef,
                    format!("compensation sequence '{}' does not exist", comp),
                ));
            }
        }

        if let Err(defects) = analyze_blocks(&sequence.steps) {
            for (index, message) in defects {
                errors.push(ConfigError::new(
                    format!("{}.steps[{}]", path, index),
                    ConfigErrorKind::UnbalancedBlock,
                    message,
                ));
            }
        }

        for (index, step) in sequence.steps.iter().enumerate() {
            let step_path = format!("{}.steps[{}]", path, index);
            match step {
                Step::Command { command, args, .. } => match config.commands.get(command) {
                    None => errors.push(ConfigError::new(
                        step_path,
                        ConfigErrorKind::UnknownRef,
                        format!("command '{}' does not exist", command),
                    )),
                    Some(def) => {
                        for param in &def.params {
                            if !args.contains_key(param) && !def.defaults.contains_key(param) {
                                errors.push(ConfigError::new(
                                    step_path.clone(),
                                    ConfigErrorKind::MissingParam,
                                    format!(
                                        "command '{}' parameter '{}' is neither supplied nor defaulted",
                                        command, param
                                    ),
                                ));
                            }
                        }
                        for arg in args.keys() {
                            if !def.params.contains(arg) {
                                errors.push(ConfigError::new(
                                    step_path.clone(),
                                    ConfigErrorKind::UnknownRef,
                                    format!("command '{}' has no parameter '{}'", command, arg),
                                ));
                            }
                        }
                    }
                },
                Step::Sequence { sequence } => {
                    if !config.sequences.contains_key(sequence) {
                        errors.push(ConfigError::new(
                            step_path,
                            ConfigErrorKind::UnknownRef,
                            format!("sequence '{}' does not exist", sequence),
                        ));
                    }
                }
                Step::If { condition } => {
                    if !config.conditions.contains_key(condition) {
                        errors.push(ConfigError::new(
                            step_path,
                            ConfigErrorKind::UnknownRef,
                            format!("condition '{}' does not exist", condition),
                        ));
                    }
                }
                Step::Parallel { branches } => {
                    for branch in branches {
                        if !config.sequences.contains_key(branch) {
                            errors.push(ConfigError::new(
                                step_path.clone(),
                                ConfigErrorKind::UnknownRef,
                                format!("sequence '{}' does not exist", branch),
                            ));
                        }
                    }
                }
                Step::Wait { .. } | Step::Else | Step::EndIf => {}
            }
        }
    }
}

fn check_cycles(config: &Configuration, errors: &mut Vec<ConfigError>) {
    // Sequence → sequence edges through nested and parallel steps.
    let mut visiting = HashSet::new();
    let mut done = HashSet::new();

    for id in config.sequences.keys() {
        let mut path = Vec::new();
        dfs(config, id, &mut visiting, &mut done, &mut path, errors);
    }
}

fn dfs(
    config: &Configuration,
    id: &str,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
    path: &mut Vec<String>,
    errors: &mut Vec<ConfigError>,
) {
    if done.contains(id) {
        return;
    }
    if !visiting.insert(id.to_string()) {
        let cycle_start = path.iter().position(|p| p == id).unwrap_or(0);
        let mut cycle: Vec<String> = path[cycle_start..].to_vec();
        cycle.push(id.to_string());
        errors.push(ConfigError::new(
            format!("sequences.{}", id),
            ConfigErrorKind::Cycle,
            format!("sequence reference cycle: {}", cycle.join(" -> ")),
        ));
        return;
    }
    path.push(id.to_string());

    if let Some(sequence) = config.sequences.get(id) {
        for step in &sequence.steps {
            match step {
                Step::Sequence { sequence: child } => {
                    dfs(config, child, visiting, done, path, errors)
                }
                Step::Parallel { branches } => {
                    for branch in branches {
                        dfs(config, branch, visiting, done, path, errors);
                    }
                }
                _ => {}
            }
        }
    }

    path.pop();
    visiting.remove(id);
    done.insert(id.to_string());
}

/// Transitive resource demand of a sequence, in first-acquisition order.
fn resource_closure(config: &Configuration, id: &str, seen: &mut HashSet<String>) -> Vec<String> {
    if !seen.insert(id.to_string()) {
        return Vec::new();
    }
    let Some(sequence) = config.sequences.get(id) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for resource in &sequence.resources {
        if !out.contains(resource) {
            out.push(resource.clone());
        }
    }
    for step in &sequence.steps {
        match step {
            Step::Sequence { sequence: child } => {
                for resource in resource_closure(config, child, seen) {
                    if !out.contains(&resource) {
                        out.push(resource);
                    }
                }
            }
            Step::Parallel { branches } => {
                for branch in branches {
                    for resource in resource_closure(config, branch, seen) {
                        if !out.contains(&resource) {
                            out.push(resource);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn check_parallel_resources(config: &Configuration, errors: &mut Vec<ConfigError>) {
    for (seq_id, sequence) in &config.sequences {
        for (index, step) in sequence.steps.iter().enumerate() {
            let Step::Parallel { branches } = step else { continue };
            let path = format!("sequences.{}.steps[{}]", seq_id, index);

            let closures: Vec<(String, Vec<String>)> = branches
                .iter()
                .map(|b| {
                    let mut seen = HashSet::new();
                    (b.clone(), resource_closure(config, b, &mut seen))
                })
                .collect();

            // Two branches declaring the same mutex would serialize the
            // block into a deadlock hazard, so that is a static error.
            // Semaphores (of any width, including 1) are fine: branches
            // queue fairly and each asks for a single permit at a time,
            // so demand can never exceed what release cycles satisfy.
            let mut demand: HashMap<String, Vec<String>> = HashMap::new();
            for (branch, resources) in &closures {
                for resource in resources {
                    demand.entry(resource.clone()).or_default().push(branch.clone());
                }
            }
            for (resource, holders) in &demand {
                if holders.len() < 2 || resource == TRANSPORT_RESOURCE {
                    // The transport mutex is held per attempt, not per
                    // step, so parallel command branches are legal.
                    continue;
                }
                let is_mutex = config
                    .resources
                    .get(resource)
                    .map(|r| matches!(r.kind, ResourceKind::Mutex) && r.members.is_empty())
                    .unwrap_or(false);
                if is_mutex {
                    errors.push(ConfigError::new(
                        path.clone(),
                        ConfigErrorKind::ResourceConflict,
                        format!(
                            "parallel branches {} share mutex '{}'",
                            holders.join(", "),
                            resource
                        ),
                    ));
                }
            }

            // Shared resources must be declared in a consistent order in
            // branches that can run side by side.
            for i in 0..closures.len() {
                for j in (i + 1)..closures.len() {
                    let (branch_a, order_a) = &closures[i];
                    let (branch_b, order_b) = &closures[j];
                    let shared: Vec<&String> =
                        order_a.iter().filter(|r| order_b.contains(r)).collect();
                    if shared.len() < 2 {
                        continue;
                    }
                    let b_positions: Vec<usize> = shared
                        .iter()
                        .map(|r| order_b.iter().position(|x| x == *r).expect("shared"))
                        .collect();
                    if b_positions.windows(2).any(|w| w[0] > w[1]) {
                        errors.push(ConfigError::new(
                            path.clone(),
                            ConfigErrorKind::ResourceConflict,
                            format!(
                                "branches '{}' and '{}' acquire shared resources in conflicting orders",
                                branch_a, branch_b
                            ),
                        ));
                    }
                }
            }
        }
    }
}

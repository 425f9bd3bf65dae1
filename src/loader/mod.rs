//! Scenario loading
//!
//! Reads YAML scenario files, substitutes `${env:NAME}` references,
//! builds actions (merging templates) and hands fully constructed
//! [`Scenario`] values to the runner.

mod definition;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::{Captures, Regex};

use crate::action::{Action, ActionDefinition};
use crate::common::{Error, Result};
use crate::expr::compile;
use crate::scenario::Scenario;

pub use definition::{ActionEntry, ScenarioEntry, ScenarioFile};

/// Load every scenario from the given files or directories
pub fn load_paths(paths: &[PathBuf]) -> Result<Vec<Scenario>> {
    let mut files = Vec::new();
    for path in paths {
        files.extend(collect_files(path)?);
    }
    if files.is_empty() {
        return Err(Error::Config("No scenario files found".to_string()));
    }

    let mut parsed = Vec::with_capacity(files.len());
    for file in &files {
        let content = std::fs::read_to_string(file).map_err(|e| Error::file_read(file, e))?;
        let definitions =
            parse_str(&content).map_err(|e| in_context(e, &file.display().to_string()))?;
        tracing::debug!(
            file = %file.display(),
            templates = definitions.templates.len(),
            scenarios = definitions.scenarios.len(),
            "loaded scenario file"
        );
        parsed.push(definitions);
    }
    build(parsed)
}

/// Expand a path into scenario files; directories contribute their
/// `*.yaml`/`*.yml` files in name order
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        if !path.exists() {
            return Err(Error::Config(format!("'{}' does not exist", path.display())));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| Error::file_read(path, e))? {
        let file = entry?.path();
        let is_yaml = matches!(
            file.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if file.is_file() && is_yaml {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse one file's content after environment substitution
pub fn parse_str(content: &str) -> Result<ScenarioFile> {
    let content = substitute_env(content, |name| std::env::var(name).ok())?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Replace `${env:NAME}` and `${env:NAME:-default}`; runtime `${expr}`
/// expressions are left alone
pub fn substitute_env<F>(content: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| Error::Internal(e.to_string()))?;

    let mut missing = Vec::new();
    let replaced = pattern.replace_all(content, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            },
        }
    });

    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "Undefined environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(replaced.into_owned())
}

/// Build scenarios from parsed files; templates are shared across files
pub fn build(files: Vec<ScenarioFile>) -> Result<Vec<Scenario>> {
    let mut templates: HashMap<String, Arc<Action>> = HashMap::new();
    let mut entries = Vec::new();

    for file in files {
        for entry in file.templates {
            if entry.template.is_some() {
                return Err(Error::Config(format!(
                    "Template '{}' cannot itself use a template",
                    entry.name
                )));
            }
            let name = entry.name.clone();
            let action = build_action(entry, &templates)?;
            if templates.insert(name.clone(), Arc::new(action)).is_some() {
                return Err(Error::Config(format!("Duplicate template '{}'", name)));
            }
        }
        entries.extend(file.scenarios);
    }

    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    let mut scenarios = Vec::with_capacity(entries.len());
    for entry in entries {
        if !names.insert(entry.name.clone()) {
            return Err(Error::Config(format!("Duplicate scenario '{}'", entry.name)));
        }
        let scenario = build_scenario(entry, &templates)?;
        if !ids.insert(scenario.id.clone()) {
            return Err(Error::Config(format!(
                "Scenario '{}' collides with another scenario's id '{}'",
                scenario.name, scenario.id
            )));
        }
        scenarios.push(scenario);
    }
    Ok(scenarios)
}

fn build_scenario(entry: ScenarioEntry, templates: &HashMap<String, Arc<Action>>) -> Result<Scenario> {
    let mut seen = HashSet::new();
    let mut actions = Vec::with_capacity(entry.actions.len());
    for action in entry.actions {
        if !seen.insert(action.name.clone()) {
            return Err(Error::Config(format!(
                "Duplicate action '{}' in scenario '{}'",
                action.name, entry.name
            )));
        }
        let built = build_action(action, templates)
            .map_err(|e| in_context(e, &format!("Scenario '{}'", entry.name)))?;
        actions.push(Arc::new(built));
    }
    Ok(Scenario::new(entry.name, entry.description, actions))
}

fn build_action(entry: ActionEntry, templates: &HashMap<String, Arc<Action>>) -> Result<Action> {
    let template = match &entry.template {
        Some(name) => Some(templates.get(name).cloned().ok_or_else(|| {
            Error::Config(format!("Action '{}' uses unknown template '{}'", entry.name, name))
        })?),
        None => None,
    };

    let kind = match (entry.kind, &template) {
        (Some(kind), _) => kind,
        (None, Some(template)) => template.kind(),
        (None, None) => {
            return Err(Error::Config(format!("Action '{}' has no type", entry.name)))
        }
    };

    let action_name = entry.name.clone();
    let (meta, fields) = entry.into_parts();
    let def = ActionDefinition::parse(kind, fields)
        .map_err(|e| in_context(e, &format!("Action '{}'", action_name)))?;

    match template {
        Some(template) => Action::from_template(meta, def, &template),
        None => Action::from_definition(meta, def),
    }
}

/// Prefix a load error with where it happened
fn in_context(error: Error, context: &str) -> Error {
    match error {
        Error::Config(message) => Error::Config(format!("{}: {}", context, message)),
        other => Error::Config(format!("{}: {}", context, other)),
    }
}

/// Parse every bare expression of a scenario without running it
pub fn check_expressions(scenario: &Scenario) -> Result<()> {
    for action in &scenario.actions {
        for source in action.expressions() {
            compile(source).map_err(|e| {
                Error::Config(format!(
                    "Scenario '{}', action '{}': {}",
                    scenario.name,
                    action.name(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

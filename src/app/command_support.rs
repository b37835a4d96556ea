use crate::app::engine::Engine;
use crate::config::load_settings;
use crate::definition::DefinitionVersion;
use crate::orchestration::RunOutcome;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Splits a leading or trailing `--config <path>` out of the argument list.
pub fn split_config_flag(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>), String> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((config, rest))
}

/// Positional arguments and `--flag value` pairs. Flags listed in
/// `switches` take no value.
#[derive(Debug, Default)]
pub struct ParsedArgs {
    pub positional: Vec<String>,
    pub flags: Vec<(String, Option<String>)>,
}

impl ParsedArgs {
    pub fn parse(args: &[String], switches: &[&str]) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut index = 0;
        while index < args.len() {
            let arg = &args[index];
            if let Some(name) = arg.strip_prefix("--") {
                if switches.contains(&name) {
                    parsed.flags.push((name.to_string(), None));
                } else {
                    let value = args
                        .get(index + 1)
                        .ok_or_else(|| format!("`--{name}` requires a value"))?;
                    parsed.flags.push((name.to_string(), Some(value.clone())));
                    index += 1;
                }
            } else {
                parsed.positional.push(arg.clone());
            }
            index += 1;
        }
        Ok(parsed)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .rev()
            .find(|(flag, _)| flag == name)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.flags.iter().any(|(flag, _)| flag == name)
    }

    pub fn reject_unknown(&self, known: &[&str]) -> Result<(), String> {
        match self.flags.iter().find(|(flag, _)| !known.contains(&flag.as_str())) {
            Some((flag, _)) => Err(format!("unknown option `--{flag}`")),
            None => Ok(()),
        }
    }
}

pub fn open_engine(config_path: Option<&Path>) -> Result<Engine, String> {
    let settings = load_settings(config_path).map_err(|e| e.to_string())?;
    Engine::from_settings(settings).map_err(|e| e.to_string())
}

pub fn parse_version(raw: Option<&str>) -> Result<DefinitionVersion, String> {
    match raw {
        Some(raw) => DefinitionVersion::parse(raw).map_err(|e| format!("invalid version: {e}")),
        None => Ok(DefinitionVersion::LatestPublished),
    }
}

/// Reads a JSON argument given inline or as `@path`.
pub fn read_json_arg(raw: &str) -> Result<Value, String> {
    let text = match raw.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))?
        }
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| format!("invalid JSON argument: {e}"))
}

pub fn read_json_object_arg(raw: &str) -> Result<Map<String, Value>, String> {
    match read_json_arg(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err("expected a JSON object".to_string()),
    }
}

pub fn outcome_json(outcome: &RunOutcome) -> Value {
    let state = outcome.state();
    let mut summary = json!({
        "flowExecutionId": state.flow_execution_id,
        "flowDefinitionId": state.flow_definition_id,
        "flowDefinitionVersion": state.flow_definition_version,
        "status": state.status.as_str(),
    });
    match outcome {
        RunOutcome::Completed(state) => {
            summary["context"] = Value::Object(state.current_context_data.clone());
        }
        RunOutcome::Failed { error, .. } => {
            summary["error"] = json!(error.error_info());
        }
        RunOutcome::Waiting {
            correlation_key, ..
        } => {
            summary["correlationKey"] = json!(correlation_key);
        }
    }
    summary
}

pub fn render_json(value: &Value) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))
}

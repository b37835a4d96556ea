use crate::app::command_support::{
    open_engine, outcome_json, parse_version, read_json_arg, read_json_object_arg, render_json,
    ParsedArgs,
};
use crate::app::engine::EngineRun;
use crate::config::load_settings;
use crate::definition::{DefinitionStore, FileDefinitionStore};
use crate::orchestration::FlowTriggerInput;
use serde_json::{json, Value};
use std::path::Path;

fn engine_run_json(run: &EngineRun) -> Value {
    let queued: Vec<Value> = run
        .queued
        .iter()
        .map(|result| match result {
            Ok(outcome) => outcome_json(outcome),
            Err(error) => json!({ "error": error.error_info() }),
        })
        .collect();
    let mut summary = outcome_json(&run.outcome);
    if !queued.is_empty() {
        summary["queuedRuns"] = Value::Array(queued);
    }
    summary
}

pub fn cmd_run(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let usage =
        "usage: run <flow_id> [--version <n|LATEST_PUBLISHED>] [--input <json|@file>] [--no-logs]";
    let parsed = ParsedArgs::parse(args, &["no-logs"])?;
    parsed.reject_unknown(&["version", "input", "no-logs", "source"])?;
    let [flow_id] = parsed.positional.as_slice() else {
        return Err(usage.to_string());
    };

    let version = parse_version(parsed.value("version"))?;
    let mut trigger = FlowTriggerInput::new(flow_id.clone(), version)
        .with_trigger_source(parsed.value("source").unwrap_or("cli"));
    if let Some(input) = parsed.value("input") {
        trigger = trigger.with_context(read_json_object_arg(input)?);
    }
    if parsed.has("no-logs") {
        trigger.enable_execution_logs = Some(false);
    }

    let engine = open_engine(config)?;
    let run = engine.run(trigger).map_err(|e| e.to_string())?;
    render_json(&engine_run_json(&run))
}

pub fn cmd_event(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &[])?;
    parsed.reject_unknown(&["payload"])?;
    let [correlation_key] = parsed.positional.as_slice() else {
        return Err("usage: event <correlation_key> [--payload <json|@file>]".to_string());
    };
    let payload = match parsed.value("payload") {
        Some(raw) => read_json_arg(raw)?,
        None => Value::Object(Default::default()),
    };

    let engine = open_engine(config)?;
    let run = engine
        .deliver_event(correlation_key, payload)
        .map_err(|e| e.to_string())?;
    render_json(&engine_run_json(&run))
}

pub fn cmd_expire_waits(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    if !args.is_empty() {
        return Err("usage: expire-waits".to_string());
    }
    let engine = open_engine(config)?;
    let outcomes = engine
        .expire_waits(chrono::Utc::now())
        .map_err(|e| e.to_string())?;
    if outcomes.is_empty() {
        return Ok("no expired waits".to_string());
    }
    render_json(&Value::Array(outcomes.iter().map(outcome_json).collect()))
}

pub fn cmd_validate(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &[])?;
    parsed.reject_unknown(&["version"])?;
    let [flow_id] = parsed.positional.as_slice() else {
        return Err("usage: validate <flow_id> [--version <n|LATEST_PUBLISHED>]".to_string());
    };
    let settings = load_settings(config).map_err(|e| e.to_string())?;
    let store = FileDefinitionStore::new(settings.definitions_root());
    let flow = store
        .load_flow_definition(flow_id, parse_version(parsed.value("version"))?)
        .map_err(|e| e.to_string())?;
    flow.validate().map_err(|e| e.to_string())?;
    Ok(format!(
        "flow valid\nflow={}\nversion={}\nsteps={}",
        flow.id,
        flow.version,
        flow.steps.len()
    ))
}

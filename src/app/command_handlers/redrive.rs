use crate::app::command_support::{
    open_engine, outcome_json, read_json_object_arg, render_json, ParsedArgs,
};
use std::path::Path;

pub fn cmd_redrive(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let usage = "usage: redrive <execution_id> [--step <step_id>] [--context <json|@file>]";
    let parsed = ParsedArgs::parse(args, &[])?;
    parsed.reject_unknown(&["step", "context"])?;
    let [execution_id] = parsed.positional.as_slice() else {
        return Err(usage.to_string());
    };

    let engine = open_engine(config)?;
    let run = match parsed.value("step") {
        Some(step_id) => {
            let context = parsed.value("context").map(read_json_object_arg).transpose()?;
            engine.stateful_redrive(execution_id, step_id, context)
        }
        None => {
            if parsed.has("context") {
                return Err("`--context` requires `--step`".to_string());
            }
            engine.simple_redrive(execution_id)
        }
    }
    .map_err(|e| e.to_string())?;

    let mut summary = outcome_json(&run.outcome);
    summary["redriveOf"] = serde_json::json!(execution_id);
    render_json(&summary)
}

use crate::app::command_support::{
    open_engine, parse_version, read_json_object_arg, render_json, ParsedArgs,
};
use crate::orchestration::SandboxStepRequest;
use std::path::Path;

pub fn cmd_sandbox(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let parsed = ParsedArgs::parse(args, &[])?;
    parsed.reject_unknown(&["version", "context"])?;
    let [flow_id, step_id] = parsed.positional.as_slice() else {
        return Err(
            "usage: sandbox <flow_id> <step_id> [--version <n>] [--context <json|@file>]"
                .to_string(),
        );
    };
    let request = SandboxStepRequest {
        flow_definition_id: flow_id.clone(),
        flow_version: parse_version(parsed.value("version"))?,
        step_instance_id: step_id.clone(),
        context: parsed
            .value("context")
            .map(read_json_object_arg)
            .transpose()?
            .unwrap_or_default(),
    };

    let engine = open_engine(config)?;
    let result = engine
        .sandbox()
        .execute_step(request)
        .map_err(|e| e.to_string())?;
    let value = serde_json::to_value(&result).map_err(|e| format!("failed to encode result: {e}"))?;
    render_json(&value)
}

use super::{StepHandler, StepHandlerOutput};
use crate::definition::ResolvedStep;
use crate::orchestration::error::StepError;
use crate::orchestration::json_path::get_path;
use crate::orchestration::state::FlowRuntimeState;
use crate::orchestration::template::render_against;
use serde_json::{Map, Value};

/// Shapes an object out of the step input. Without a `structure` in
/// `customConfig` the input passes through unchanged. With one, every string
/// leaf is rendered against the input; a leaf that is exactly one
/// placeholder keeps the referenced value's JSON type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeObjectHandler;

fn single_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}

fn compose(structure: &Value, input: &Value) -> Result<Value, StepError> {
    match structure {
        Value::String(text) => {
            if let Some(path) = single_placeholder(text) {
                let found = get_path(input, path)
                    .map_err(|err| StepError::permanent(err.to_string()))?;
                return Ok(found.cloned().unwrap_or(Value::Null));
            }
            render_against(text, input)
                .map(Value::String)
                .map_err(StepError::permanent)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| compose(item, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(object) => object
            .iter()
            .map(|(key, value)| Ok((key.clone(), compose(value, input)?)))
            .collect::<Result<Map<_, _>, StepError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

impl StepHandler for ComposeObjectHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let input = Value::Object(input.clone());
        let output = match step.base.custom_config.get("structure") {
            Some(structure) => compose(structure, &input)?,
            None => input,
        };
        Ok(StepHandlerOutput::data(output))
    }
}

use super::error::StepError;
use super::json_path::{parse_path, set_in_map, JsonPathError, PathSegment};
use super::state::FlowRuntimeState;
use crate::definition::StepBase;
use crate::storage::{is_offload_wrapper, PayloadOffloader, S3Pointer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Key under which runtime fields are exposed to mappings and conditions.
pub const FLOW_RUNTIME_KEY: &str = "_flow_runtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingEventKind {
    Literal,
    Mapped,
    Omitted,
    PointerResolved,
}

/// One observable decision taken while building a step's input or folding
/// its output back into the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEvent {
    pub kind: MappingEventKind,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MappingEvent {
    fn new(kind: MappingEventKind, target_path: &str, source_path: Option<&str>) -> Self {
        Self {
            kind,
            target_path: target_path.to_string(),
            source_path: source_path.map(str::to_string),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputMappingResult {
    pub input: Map<String, Value>,
    pub events: Vec<MappingEvent>,
}

/// `currentContextData` plus the addressable runtime fields.
pub fn build_mapping_context(state: &FlowRuntimeState) -> Value {
    let mut context = state.current_context_data.clone();
    context.insert(
        FLOW_RUNTIME_KEY.to_string(),
        json!({
            "flowExecutionId": state.flow_execution_id,
            "flowDefinitionId": state.flow_definition_id,
            "flowDefinitionVersion": state.flow_definition_version,
            "currentStepInstanceId": state.current_step_instance_id,
            "startTime": state.start_time,
            "stepRetryAttempts": state.step_retry_attempts,
        }),
    );
    Value::Object(context)
}

fn path_error(err: JsonPathError) -> StepError {
    StepError::permanent(err.to_string())
}

/// Follows `segments` from `root`, transparently resolving offload wrappers
/// found anywhere along the way.
pub fn lookup_resolving(
    root: &Value,
    segments: &[PathSegment],
    offloader: Option<&PayloadOffloader>,
) -> Result<Option<Value>, StepError> {
    let mut current = root;
    for (position, segment) in segments.iter().enumerate() {
        if let Some(pointer) = S3Pointer::from_wrapper(current) {
            let Some(offloader) = offloader else {
                return Err(StepError::permanent(format!(
                    "value at {pointer} is offloaded and no blob store is configured"
                )));
            };
            let resolved = offloader.resolve_pointer(&pointer)?;
            return lookup_resolving(&resolved, &segments[position..], Some(offloader));
        }
        let next = match segment {
            PathSegment::Key(key) => current.as_object().and_then(|object| object.get(key)),
            PathSegment::Index(index) => current.as_array().and_then(|items| items.get(*index)),
        };
        match next {
            Some(value) => current = value,
            None => return Ok(None),
        }
    }
    match (S3Pointer::from_wrapper(current), offloader) {
        (Some(pointer), Some(offloader)) => Ok(Some(offloader.resolve_pointer(&pointer)?)),
        _ => Ok(Some(current.clone())),
    }
}

/// Literals first, then `inputMappings` (mapped values win). Optional sources
/// that are absent are omitted; required ones fail permanently.
pub fn build_step_input(
    base: &StepBase,
    mapping_context: &Value,
    offloader: Option<&PayloadOffloader>,
) -> Result<InputMappingResult, StepError> {
    let mut result = InputMappingResult::default();

    for (target, literal) in &base.literals {
        set_in_map(&mut result.input, target, literal.clone()).map_err(path_error)?;
        result
            .events
            .push(MappingEvent::new(MappingEventKind::Literal, target, None));
    }

    for (target, source) in &base.input_mappings {
        let segments = parse_path(source.path()).map_err(path_error)?;
        let through_pointer = super::json_path::get(mapping_context, &segments)
            .map(is_offload_wrapper)
            .unwrap_or(true);

        match lookup_resolving(mapping_context, &segments, offloader)? {
            Some(value) => {
                set_in_map(&mut result.input, target, value).map_err(path_error)?;
                let kind = if through_pointer && offloader.is_some() {
                    MappingEventKind::PointerResolved
                } else {
                    MappingEventKind::Mapped
                };
                result
                    .events
                    .push(MappingEvent::new(kind, target, Some(source.path())));
            }
            None if source.is_required() => {
                return Err(StepError::permanent(format!(
                    "required input mapping `{target}` found nothing at `{}`",
                    source.path()
                )));
            }
            None => {
                let mut event =
                    MappingEvent::new(MappingEventKind::Omitted, target, Some(source.path()));
                event.detail = Some("source path not found".to_string());
                result.events.push(event);
            }
        }
    }

    Ok(result)
}

/// Copies slices of a handler's output into the context:
/// `{contextTargetPath: outputSourcePath}`.
pub fn apply_output_mappings(
    output_mappings: &BTreeMap<String, String>,
    output: &Value,
    context: &mut Map<String, Value>,
    offloader: Option<&PayloadOffloader>,
) -> Result<Vec<MappingEvent>, StepError> {
    let mut events = Vec::with_capacity(output_mappings.len());
    for (target, source) in output_mappings {
        let segments = parse_path(source).map_err(path_error)?;
        match lookup_resolving(output, &segments, offloader)? {
            Some(value) => {
                set_in_map(context, target, value).map_err(path_error)?;
                events.push(MappingEvent::new(
                    MappingEventKind::Mapped,
                    target,
                    Some(source),
                ));
            }
            None => {
                let mut event = MappingEvent::new(MappingEventKind::Omitted, target, Some(source));
                event.detail = Some("output path not found".to_string());
                events.push(event);
            }
        }
    }
    Ok(events)
}

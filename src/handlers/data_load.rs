use super::{StepHandler, StepHandlerOutput};
use crate::definition::ResolvedStep;
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use crate::storage::{PayloadOffloader, S3Pointer};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Loads a blob named by the step input: either a pointer wrapper, a bare
/// `{bucket, key}` object under `source`, or `bucket` and `key` fields
/// (with `customConfig` supplying defaults).
pub struct DataLoadHandler {
    offloader: Option<Arc<PayloadOffloader>>,
}

impl DataLoadHandler {
    pub fn new(offloader: Option<Arc<PayloadOffloader>>) -> Self {
        Self { offloader }
    }

    fn pointer(step: &ResolvedStep, input: &Map<String, Value>) -> Option<S3Pointer> {
        if let Some(source) = input.get("source") {
            let pointer =
                S3Pointer::from_wrapper(source).or_else(|| S3Pointer::from_value(source));
            if pointer.is_some() {
                return pointer;
            }
        }
        let field = |name: &str| {
            input
                .get(name)
                .or_else(|| step.base.custom_config.get(name))
                .and_then(Value::as_str)
        };
        match (field("bucket"), field("key")) {
            (Some(bucket), Some(key)) => Some(S3Pointer::new(bucket, key)),
            _ => None,
        }
    }
}

impl StepHandler for DataLoadHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let pointer = Self::pointer(step, input).ok_or_else(|| {
            StepError::permanent("data load needs `source` or `bucket` and `key` in its input")
        })?;
        let offloader = self
            .offloader
            .as_ref()
            .ok_or_else(|| StepError::permanent("data load requires a configured blob store"))?;
        let content = offloader.resolve_pointer(&pointer)?;
        Ok(StepHandlerOutput::data(json!({
            "content": content,
            "source": pointer.to_value(),
        })))
    }
}

use super::{DefinitionError, StepInstance};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_START_STEP_INSTANCE_ID: &str = "start_step";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: BTreeMap<String, StepInstance>,
    pub start_step_instance_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub flow_variables: Map<String, Value>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default = "default_enable_execution_logs")]
    pub enable_execution_logs: bool,
}

fn default_enable_execution_logs() -> bool {
    true
}

impl FlowDefinition {
    /// A fresh, unpublished version holding a single NO_OP start step.
    pub fn new_draft(id: impl Into<String>, name: impl Into<String>) -> Self {
        let start = StepInstance::no_op(DEFAULT_START_STEP_INSTANCE_ID);
        Self {
            id: id.into(),
            version: 1,
            name: name.into(),
            description: None,
            steps: BTreeMap::from([(start.step_instance_id.clone(), start)]),
            start_step_instance_id: DEFAULT_START_STEP_INSTANCE_ID.to_string(),
            flow_variables: Map::new(),
            is_published: false,
            enable_execution_logs: true,
        }
    }

    pub fn step(&self, step_instance_id: &str) -> Result<&StepInstance, DefinitionError> {
        self.steps
            .get(step_instance_id)
            .ok_or_else(|| DefinitionError::StepInstanceNotFound {
                flow_id: self.id.clone(),
                version: self.version,
                step_instance_id: step_instance_id.to_string(),
            })
    }

    /// Published versions are immutable until unpublished again.
    pub fn ensure_editable(&self) -> Result<(), DefinitionError> {
        if self.is_published {
            return Err(DefinitionError::Invalid {
                kind: "flow definition",
                id: self.id.clone(),
                reason: format!("version {} is published; unpublish before editing", self.version),
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        let invalid = |reason: String| DefinitionError::Invalid {
            kind: "flow definition",
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must be non-empty".to_string()));
        }
        if !self.steps.contains_key(&self.start_step_instance_id) {
            return Err(invalid(format!(
                "startStepInstanceId `{}` does not name a step",
                self.start_step_instance_id
            )));
        }
        for (key, step) in &self.steps {
            if key != &step.step_instance_id {
                return Err(invalid(format!(
                    "step key `{key}` does not match stepInstanceId `{}`",
                    step.step_instance_id
                )));
            }
            if step.step_definition_id.is_none() && step.declared_step_type().is_none() {
                return Err(invalid(format!(
                    "step `{key}` needs either stepDefinitionId or stepType"
                )));
            }
            for target in step.successor_ids() {
                if !self.steps.contains_key(target) {
                    return Err(invalid(format!(
                        "step `{key}` transitions to unknown step `{target}`"
                    )));
                }
            }
            if let Some(fallback) = step
                .overrides
                .get("onError")
                .and_then(|v| v.get("fallbackStepInstanceId"))
                .and_then(Value::as_str)
            {
                if !self.steps.contains_key(fallback) {
                    return Err(invalid(format!(
                        "step `{key}` falls back to unknown step `{fallback}`"
                    )));
                }
            }
        }
        Ok(())
    }
}

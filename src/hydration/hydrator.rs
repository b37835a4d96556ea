use super::deep_merge;
use crate::definition::{
    is_system_step_id, system_step_definition, DefinitionError, DefinitionStore, ResolvedStep,
    StepDefinition, StepInstance,
};
use crate::orchestration::error::StepError;
use serde_json::Value;
use std::sync::Arc;

/// Identity and bookkeeping fields of a step definition that never flow into
/// the hydrated step.
pub const STRIPPED_DEFINITION_FIELDS: [&str; 7] = [
    "id",
    "name",
    "version",
    "createdAt",
    "updatedAt",
    "description",
    "isPublished",
];

#[derive(Clone)]
pub struct DefinitionHydrator {
    definitions: Arc<dyn DefinitionStore>,
}

impl DefinitionHydrator {
    pub fn new(definitions: Arc<dyn DefinitionStore>) -> Self {
        Self { definitions }
    }

    pub fn hydrate(&self, instance: &StepInstance) -> Result<ResolvedStep, StepError> {
        let merged = self.merged_value(instance)?;
        serde_json::from_value::<ResolvedStep>(merged).map_err(|err| {
            StepError::permanent(format!(
                "step `{}` is incomplete after hydration: {err}",
                instance.step_instance_id
            ))
            .in_step(&instance.step_instance_id)
        })
    }

    /// The untyped merge result, before validation into a [`ResolvedStep`].
    pub fn merged_value(&self, instance: &StepInstance) -> Result<Value, StepError> {
        let instance_value = serde_json::to_value(instance).map_err(|err| {
            StepError::permanent(format!(
                "step `{}` could not be encoded: {err}",
                instance.step_instance_id
            ))
        })?;

        let Some(definition_id) = instance.step_definition_id.as_deref() else {
            return Ok(instance_value);
        };

        let definition = self
            .load_definition(definition_id)
            .map_err(|err| err.in_step(&instance.step_instance_id))?;
        if let Some(declared) = instance.declared_step_type() {
            if declared != definition.step_type().as_str() {
                return Err(StepError::permanent(format!(
                    "step `{}` declares stepType {declared} but definition `{definition_id}` is {}",
                    instance.step_instance_id,
                    definition.step_type()
                ))
                .in_step(&instance.step_instance_id));
            }
        }

        let mut base = serde_json::to_value(&definition).map_err(|err| {
            StepError::permanent(format!(
                "step definition `{definition_id}` could not be encoded: {err}"
            ))
        })?;
        if let Some(object) = base.as_object_mut() {
            for field in STRIPPED_DEFINITION_FIELDS {
                object.remove(field);
            }
        }

        tracing::debug!(
            step_instance_id = %instance.step_instance_id,
            step_definition_id = definition_id,
            "hydrating step instance from definition"
        );
        Ok(deep_merge(base, instance_value))
    }

    fn load_definition(&self, id: &str) -> Result<StepDefinition, StepError> {
        if is_system_step_id(id) {
            return system_step_definition(id).ok_or_else(|| {
                StepError::from(DefinitionError::StepNotFound { id: id.to_string() })
            });
        }
        Ok(self.definitions.load_step_definition(id)?)
    }
}

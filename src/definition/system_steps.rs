use super::{ModuleStepConfig, StepBase, StepDefinition, StepPayload};

pub const SYSTEM_STEP_PREFIX: &str = "system-";

pub fn is_system_step_id(id: &str) -> bool {
    id.starts_with(SYSTEM_STEP_PREFIX)
}

struct SystemStep {
    id: &'static str,
    name: &'static str,
    module_identifier: &'static str,
    description: &'static str,
}

const SYSTEM_STEPS: &[SystemStep] = &[
    SystemStep {
        id: "system-data-join",
        name: "Join two datasets",
        module_identifier: "system/data-join",
        description: "Joins two CSV or JSON-array datasets on one or more key columns.",
    },
    SystemStep {
        id: "system-compose-object",
        name: "Compose object",
        module_identifier: "system/compose-object",
        description: "Builds an object from the step input and an optional structure template.",
    },
    SystemStep {
        id: "system-bom-extract",
        name: "Extract bill of materials",
        module_identifier: "system/bom-extract",
        description: "Extracts a parts table from a sparse worksheet cell list.",
    },
];

/// Synthesizes the in-memory definition for a reserved `system-*` step id.
pub fn system_step_definition(id: &str) -> Option<StepDefinition> {
    SYSTEM_STEPS.iter().find(|step| step.id == id).map(|step| StepDefinition {
        id: step.id.to_string(),
        name: step.name.to_string(),
        version: 1,
        description: Some(step.description.to_string()),
        is_published: true,
        created_at: None,
        updated_at: None,
        payload: StepPayload::DataTransformation(ModuleStepConfig {
            module_identifier: step.module_identifier.to_string(),
        }),
        base: StepBase::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_system_step_satisfies_the_reserved_prefix_rule() {
        for step in SYSTEM_STEPS {
            let definition = system_step_definition(step.id).expect("system step");
            definition.validate().expect("system step is valid");
        }
        assert!(system_step_definition("system-unknown").is_none());
    }
}

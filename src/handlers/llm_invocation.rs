use super::{StepHandler, StepHandlerOutput};
use crate::definition::{DefinitionStore, LlmInvocationConfig, ResolvedStep, StepPayload};
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use crate::orchestration::template::render_against;
use crate::provider::{
    parse_strict_json, FailureKind, LlmAdapterFactory, LlmGenerationRequest, LlmProviderKind,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub struct LlmInvocationHandler {
    definitions: Arc<dyn DefinitionStore>,
    adapters: Arc<LlmAdapterFactory>,
}

impl LlmInvocationHandler {
    pub fn new(definitions: Arc<dyn DefinitionStore>, adapters: Arc<LlmAdapterFactory>) -> Self {
        Self {
            definitions,
            adapters,
        }
    }

    fn config(step: &ResolvedStep) -> Result<&LlmInvocationConfig, StepError> {
        match &step.payload {
            StepPayload::LlmInvocation(config) => Ok(config),
            other => Err(StepError::permanent(format!(
                "llm handler cannot run a {} step",
                other.step_type()
            ))),
        }
    }
}

impl StepHandler for LlmInvocationHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let config = Self::config(step)?;
        let template = self
            .definitions
            .load_prompt_template(&config.prompt_template_id, config.prompt_template_version)?;
        let prompt = render_against(&template.content, &Value::Object(input.clone())).map_err(
            |reason| {
                StepError::permanent(format!(
                    "prompt template `{}` could not be rendered: {reason}",
                    template.id
                ))
            },
        )?;

        let provider = LlmProviderKind::try_from(config.llm_provider.as_str())?;
        let adapter = self.adapters.adapter(provider)?;
        let params = &config.inference_parameters;
        let request = LlmGenerationRequest {
            provider,
            model_id: config.model_id.clone(),
            prompt: prompt.clone(),
            temperature: params.temperature,
            max_output_tokens: params.max_output_tokens,
            top_p: params.top_p,
            top_k: params.top_k,
            seed: params.seed,
            custom_config: step.base.custom_config.clone(),
            json_output_mode: config.json_output_mode,
            correlation_id: format!(
                "{}:{}:{}",
                state.flow_execution_id,
                step.step_instance_id,
                state.attempt_number(&step.step_instance_id)
            ),
        };

        tracing::info!(
            step_instance_id = %step.step_instance_id,
            provider = %provider,
            model_id = %config.model_id,
            "invoking llm"
        );
        let response = adapter.generate_content(&request);

        let mut meta = json!({
            "provider": provider,
            "modelId": config.model_id,
            "promptTemplateId": template.id,
            "promptTemplateVersion": template.version,
            "renderedPrompt": prompt,
            "rawResponse": response.response_text,
            "tokenUsage": response.token_usage,
        });

        if !response.success {
            let message = response
                .error_message
                .clone()
                .unwrap_or_else(|| "llm provider call failed".to_string());
            let error = if response.safety_flagged {
                StepError::permanent(format!("llm response was safety-flagged: {message}"))
            } else if response.failure_kind == Some(FailureKind::Transient) {
                StepError::transient(message)
            } else {
                StepError::permanent(message)
            };
            return Err(error.with_details(meta));
        }

        let text = response.response_text.clone().unwrap_or_default();
        let llm_response = if config.json_output_mode {
            match parse_strict_json(&text) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    return Err(StepError::content_retryable(reason).with_details(meta));
                }
            }
        } else {
            Value::String(text)
        };

        if let Some(object) = meta.as_object_mut() {
            object.insert("jsonOutputMode".to_string(), json!(config.json_output_mode));
        }
        Ok(StepHandlerOutput::data(json!({ "llm_response": llm_response })).with_meta(meta))
    }
}

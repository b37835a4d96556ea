use super::{DefinitionError, DefinitionVersion};
use crate::shared::ids::normalize_module_identifier;
use crate::shared::HttpMethod;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    NoOp,
    LlmInvocation,
    DataLoad,
    DataTransformation,
    CustomLogic,
    ApiCall,
    Email,
    StartSubFlow,
    ParallelForkManager,
    WaitForExternalEvent,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoOp => "NO_OP",
            Self::LlmInvocation => "LLM_INVOCATION",
            Self::DataLoad => "DATA_LOAD",
            Self::DataTransformation => "DATA_TRANSFORMATION",
            Self::CustomLogic => "CUSTOM_LOGIC",
            Self::ApiCall => "API_CALL",
            Self::Email => "EMAIL",
            Self::StartSubFlow => "START_SUB_FLOW",
            Self::ParallelForkManager => "PARALLEL_FORK_MANAGER",
            Self::WaitForExternalEvent => "WAIT_FOR_EXTERNAL_EVENT",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific step payload, discriminated by `stepType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPayload {
    NoOp,
    LlmInvocation(LlmInvocationConfig),
    DataLoad,
    DataTransformation(ModuleStepConfig),
    CustomLogic(ModuleStepConfig),
    ApiCall(ApiCallConfig),
    Email(EmailConfig),
    StartSubFlow(SubFlowConfig),
    ParallelForkManager(ParallelForkConfig),
    WaitForExternalEvent(WaitForEventConfig),
}

impl StepPayload {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::NoOp => StepType::NoOp,
            Self::LlmInvocation(_) => StepType::LlmInvocation,
            Self::DataLoad => StepType::DataLoad,
            Self::DataTransformation(_) => StepType::DataTransformation,
            Self::CustomLogic(_) => StepType::CustomLogic,
            Self::ApiCall(_) => StepType::ApiCall,
            Self::Email(_) => StepType::Email,
            Self::StartSubFlow(_) => StepType::StartSubFlow,
            Self::ParallelForkManager(_) => StepType::ParallelForkManager,
            Self::WaitForExternalEvent(_) => StepType::WaitForExternalEvent,
        }
    }

    pub fn module_identifier(&self) -> Option<&str> {
        match self {
            Self::DataTransformation(config) | Self::CustomLogic(config) => {
                Some(config.module_identifier.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmInvocationConfig {
    pub llm_provider: String,
    pub model_id: String,
    pub prompt_template_id: String,
    #[serde(default)]
    pub prompt_template_version: DefinitionVersion,
    #[serde(default)]
    pub inference_parameters: InferenceParameters,
    #[serde(default)]
    pub json_output_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStepConfig {
    pub module_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_http_method: HttpMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailBodyFormat {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub body_format: EmailBodyFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubFlowConfig {
    pub sub_flow_definition_id: String,
    #[serde(default)]
    pub sub_flow_version: DefinitionVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStrategy {
    #[default]
    CollectArray,
    MergeObjects,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default = "default_fail_on_branch_error")]
    pub fail_on_branch_error: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::default(),
            output_path: None,
            fail_on_branch_error: true,
        }
    }
}

fn default_fail_on_branch_error() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelBranchConfig {
    pub branch_id: String,
    pub step_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelForkConfig {
    /// Path into the step input selecting the array to fan out over. When
    /// absent every declared branch runs exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    pub parallel_branches: Vec<ParallelBranchConfig>,
    #[serde(default)]
    pub aggregation_config: AggregationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

fn default_item_variable() -> String {
    "currentItem".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForEventConfig {
    pub correlation_key_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Where a mapped input value comes from. A bare string is an optional JSON
/// path; the object form can mark the source as required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingSource {
    Path(String),
    Detailed {
        #[serde(rename = "sourceJsonPath")]
        source_json_path: String,
        #[serde(default)]
        required: bool,
    },
}

impl MappingSource {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Detailed {
                source_json_path, ..
            } => source_json_path,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Detailed { required: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRetryConfig {
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnErrorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_instance_id: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<StepRetryConfig>,
}

impl OnErrorConfig {
    pub fn routes_errors(&self) -> bool {
        self.fallback_step_instance_id.is_some() || self.continue_on_failure
    }
}

/// Fields shared by step definitions and step instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBase {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mappings: BTreeMap<String, MappingSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mappings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub literals: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub condition: String,
    pub next_step_instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayPosition {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDelay {
    pub milliseconds: u64,
    pub position: DelayPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_definition_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub payload: StepPayload,
    #[serde(flatten)]
    pub base: StepBase,
}

fn default_definition_version() -> u32 {
    1
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.payload.step_type()
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::Invalid {
                kind: "step definition",
                id: self.id.clone(),
                reason: "id must be non-empty".to_string(),
            });
        }
        if super::is_system_step_id(&self.id) {
            let expected = normalize_module_identifier(&self.id);
            let actual = self
                .payload
                .module_identifier()
                .map(normalize_module_identifier);
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(DefinitionError::Invalid {
                    kind: "step definition",
                    id: self.id.clone(),
                    reason: format!(
                        "reserved step ids require a moduleIdentifier matching `{expected}`"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Rejects updates that would change the step type of an existing definition.
    pub fn validate_update(&self, previous: &StepDefinition) -> Result<(), DefinitionError> {
        if self.step_type() != previous.step_type() {
            return Err(DefinitionError::Invalid {
                kind: "step definition",
                id: self.id.clone(),
                reason: format!(
                    "stepType is immutable (was {}, got {})",
                    previous.step_type(),
                    self.step_type()
                ),
            });
        }
        self.validate()
    }
}

/// A step's placement inside a flow version. Payload and base fields stay
/// untyped in `overrides` until hydration merges them with the referenced
/// definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    pub step_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<StepDelay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<StepPosition>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_s3_offload: bool,
    #[serde(flatten)]
    pub overrides: Map<String, Value>,
}

impl StepInstance {
    pub fn no_op(step_instance_id: impl Into<String>) -> Self {
        Self {
            step_instance_id: step_instance_id.into(),
            step_definition_id: None,
            transitions: Vec::new(),
            default_next_step_instance_id: None,
            delay: None,
            position: None,
            disable_s3_offload: false,
            overrides: Map::from_iter([(
                "stepType".to_string(),
                Value::String(StepType::NoOp.as_str().to_string()),
            )]),
        }
    }

    pub fn declared_step_type(&self) -> Option<&str> {
        self.overrides.get("stepType").and_then(Value::as_str)
    }

    pub fn successor_ids(&self) -> impl Iterator<Item = &str> {
        self.transitions
            .iter()
            .map(|t| t.next_step_instance_id.as_str())
            .chain(self.default_next_step_instance_id.as_deref())
    }
}

/// A fully hydrated step, ready to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStep {
    pub step_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<StepDelay>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_s3_offload: bool,
    #[serde(flatten)]
    pub payload: StepPayload,
    #[serde(flatten)]
    pub base: StepBase,
}

impl ResolvedStep {
    pub fn step_type(&self) -> StepType {
        self.payload.step_type()
    }

    pub fn on_error(&self) -> Option<&OnErrorConfig> {
        self.base.on_error.as_ref()
    }

    pub fn retry_config(&self) -> Option<StepRetryConfig> {
        self.base.on_error.as_ref().and_then(|config| config.retries)
    }
}

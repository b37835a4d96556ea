use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_OFFLOAD_THRESHOLD_BYTES: usize = 10 * 1024;

pub const OFFLOAD_THRESHOLD_ENV: &str = "ALLMA_OFFLOAD_THRESHOLD_BYTES";
pub const OFFLOAD_BUCKET_ENV: &str = "ALLMA_OFFLOAD_BUCKET";
pub const STATE_ROOT_ENV: &str = "ALLMA_STATE_ROOT";
pub const EXECUTION_LOGS_ENABLED_ENV: &str = "ALLMA_EXECUTION_LOGS_ENABLED";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default)]
    pub offload: OffloadSettings,
    #[serde(default)]
    pub execution_logs: ExecutionLogSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            offload: OffloadSettings::default(),
            execution_logs: ExecutionLogSettings::default(),
            providers: ProviderSettings::default(),
            email: EmailSettings::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".allma")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OffloadSettings {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: usize,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for OffloadSettings {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            threshold_bytes: default_threshold_bytes(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_bucket() -> String {
    "allma-execution-traces".to_string()
}

fn default_threshold_bytes() -> usize {
    DEFAULT_OFFLOAD_THRESHOLD_BYTES
}

fn default_key_prefix() -> String {
    "flow_executions".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutionLogSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for ExecutionLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub gemini: GeminiSettings,
    #[serde(default)]
    pub bedrock: BedrockSettings,
    #[serde(default)]
    pub retry: ProviderRetrySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GeminiSettings {
    #[serde(default = "default_gemini_api_base")]
    pub api_base: String,
    #[serde(default = "default_gemini_api_key_env")]
    pub api_key_env: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_base: default_gemini_api_base(),
            api_key_env: default_gemini_api_key_env(),
        }
    }
}

fn default_gemini_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BedrockSettings {
    #[serde(default = "default_bedrock_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_bedrock_api_key_env")]
    pub api_key_env: String,
}

impl Default for BedrockSettings {
    fn default() -> Self {
        Self {
            region: default_bedrock_region(),
            endpoint: None,
            api_key_env: default_bedrock_api_key_env(),
        }
    }
}

fn default_bedrock_region() -> String {
    "us-east-1".to_string()
}

fn default_bedrock_api_key_env() -> String {
    "AWS_BEARER_TOKEN_BEDROCK".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderRetrySettings {
    #[serde(default = "default_provider_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_provider_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_provider_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ProviderRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_provider_attempts(),
            base_delay_ms: default_provider_base_delay_ms(),
            max_delay_ms: default_provider_max_delay_ms(),
        }
    }
}

fn default_provider_attempts() -> u32 {
    3
}

fn default_provider_base_delay_ms() -> u64 {
    500
}

fn default_provider_max_delay_ms() -> u64 {
    8_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub outbox_dir: Option<PathBuf>,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            outbox_dir: None,
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

fn default_max_attachment_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default)]
    pub step_retry: StepRetrySettings,
    #[serde(default = "default_max_branch_concurrency")]
    pub max_branch_concurrency: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            step_retry: StepRetrySettings::default(),
            max_branch_concurrency: default_max_branch_concurrency(),
        }
    }
}

fn default_max_cycles() -> u32 {
    1_000
}

fn default_max_branch_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct StepRetrySettings {
    #[serde(default = "default_step_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_step_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

impl Default for StepRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_step_attempts(),
            interval_ms: default_step_interval_ms(),
            backoff_rate: default_backoff_rate(),
        }
    }
}

fn default_step_attempts() -> u32 {
    3
}

fn default_step_interval_ms() -> u64 {
    1_000
}

fn default_backoff_rate() -> f64 {
    2.0
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Same as [`Settings::apply_env_overrides`] with an injectable lookup so
    /// callers do not have to mutate the process environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(raw) = read(OFFLOAD_THRESHOLD_ENV) {
            self.offload.threshold_bytes =
                raw.trim()
                    .parse::<usize>()
                    .map_err(|err| ConfigError::EnvOverride {
                        name: OFFLOAD_THRESHOLD_ENV.to_string(),
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
        }
        if let Some(raw) = read(OFFLOAD_BUCKET_ENV) {
            self.offload.bucket = raw.trim().to_string();
        }
        if let Some(raw) = read(STATE_ROOT_ENV) {
            self.state_root = PathBuf::from(raw.trim());
        }
        if let Some(raw) = read(EXECUTION_LOGS_ENABLED_ENV) {
            self.execution_logs.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::EnvOverride {
                        name: EXECUTION_LOGS_ENABLED_ENV.to_string(),
                        value: raw,
                        reason: "expected true or false".to_string(),
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be non-empty".to_string(),
            ));
        }
        if self.offload.bucket.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`offload.bucket` must be non-empty".to_string(),
            ));
        }
        if self.offload.threshold_bytes == 0 {
            return Err(ConfigError::Settings(
                "`offload.threshold_bytes` must be greater than zero".to_string(),
            ));
        }
        if self.providers.retry.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "`providers.retry.max_attempts` must be at least 1".to_string(),
            ));
        }
        if self.providers.retry.base_delay_ms > self.providers.retry.max_delay_ms {
            return Err(ConfigError::Settings(
                "`providers.retry.base_delay_ms` must not exceed `max_delay_ms`".to_string(),
            ));
        }
        if self.orchestrator.max_cycles == 0 {
            return Err(ConfigError::Settings(
                "`orchestrator.max_cycles` must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.max_branch_concurrency == 0 {
            return Err(ConfigError::Settings(
                "`orchestrator.max_branch_concurrency` must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.step_retry.backoff_rate < 1.0 {
            return Err(ConfigError::Settings(
                "`orchestrator.step_retry.backoff_rate` must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn definitions_root(&self) -> PathBuf {
        self.state_root.join("definitions")
    }

    pub fn blobs_root(&self) -> PathBuf {
        self.state_root.join("blobs")
    }

    pub fn execution_log_database_path(&self) -> PathBuf {
        self.execution_logs
            .database_path
            .clone()
            .unwrap_or_else(|| self.state_root.join("execution_logs.sqlite"))
    }

    pub fn continuation_database_path(&self) -> PathBuf {
        self.state_root.join("continuations.sqlite")
    }

    pub fn email_outbox_dir(&self) -> PathBuf {
        self.email
            .outbox_dir
            .clone()
            .unwrap_or_else(|| self.state_root.join("outbox"))
    }
}

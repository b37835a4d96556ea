pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_settings, resolve_settings_path, CONFIG_PATH_ENV};
pub use settings::{
    BedrockSettings, EmailSettings, ExecutionLogSettings, GeminiSettings, OffloadSettings,
    OrchestratorSettings, ProviderRetrySettings, ProviderSettings, Settings, StepRetrySettings,
    DEFAULT_OFFLOAD_THRESHOLD_BYTES,
};

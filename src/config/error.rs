#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment override `{name}` has invalid value `{value}`: {reason}")]
    EnvOverride {
        name: String,
        value: String,
        reason: String,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("flow definition `{id}` version {version} not found")]
    FlowNotFound { id: String, version: String },
    #[error("step definition `{id}` not found")]
    StepNotFound { id: String },
    #[error("prompt template `{id}` version {version} not found")]
    PromptNotFound { id: String, version: String },
    #[error("{kind} `{id}` has no published version")]
    NotPublished { kind: &'static str, id: String },
    #[error("step instance `{step_instance_id}` not found in flow `{flow_id}` version {version}")]
    StepInstanceNotFound {
        flow_id: String,
        version: u32,
        step_instance_id: String,
    },
    #[error("invalid {kind} `{id}`: {reason}")]
    Invalid {
        kind: &'static str,
        id: String,
        reason: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse definition file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to encode definition file {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("definition store unavailable: {0}")]
    Unavailable(String),
}

use crate::config::{ConfigError, Settings};
use crate::definition::{DefinitionStore, FileDefinitionStore};
use crate::execution_log::{
    ExecutionLogError, ExecutionLogStore, ExecutionLogger, SqliteExecutionLogStore,
};
use crate::handlers::{
    EmailTransport, HandlerDependencies, OutboxEmailTransport, StepHandlerRegistry,
};
use crate::orchestration::{
    ContinuationError, ContinuationStore, FlowFinalizer, FlowInitializer, FlowTriggerInput,
    LocalOrchestrator, QueuedFlowStarter, RedriveController, RunOutcome, SandboxController,
    SqliteContinuationStore, StepError, StepProcessor,
};
use crate::provider::LlmAdapterFactory;
use crate::shared::logging::append_engine_log_event;
use crate::shared::{HttpClient, UreqHttpClient};
use crate::storage::{BlobStore, FileBlobStore, PayloadOffloader};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    ExecutionLog(#[from] ExecutionLogError),
    #[error(transparent)]
    Continuation(#[from] ContinuationError),
}

/// The external collaborators an [`Engine`] is assembled from.
pub struct EngineParts {
    pub definitions: Arc<dyn DefinitionStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub log_store: Arc<dyn ExecutionLogStore>,
    pub continuations: Arc<dyn ContinuationStore>,
    pub email_transport: Arc<dyn EmailTransport>,
    pub http: Arc<dyn HttpClient>,
}

/// Result of one engine call: the run it was asked for plus every run it
/// queued along the way (sub-flows, redrives).
#[derive(Debug)]
pub struct EngineRun {
    pub outcome: RunOutcome,
    pub queued: Vec<Result<RunOutcome, StepError>>,
}

pub struct Engine {
    settings: Settings,
    state_root: Option<PathBuf>,
    log_store: Arc<dyn ExecutionLogStore>,
    starter: Arc<QueuedFlowStarter>,
    orchestrator: LocalOrchestrator,
    redrive: RedriveController,
    sandbox: SandboxController,
}

impl Engine {
    /// File-backed engine rooted at `settings.state_root`.
    pub fn from_settings(settings: Settings) -> Result<Self, EngineError> {
        let log_store = SqliteExecutionLogStore::open(&settings.execution_log_database_path())?;
        let continuations = SqliteContinuationStore::open(&settings.continuation_database_path())?;
        let parts = EngineParts {
            definitions: Arc::new(FileDefinitionStore::new(settings.definitions_root())),
            blobs: Arc::new(FileBlobStore::new(settings.blobs_root())),
            log_store: Arc::new(log_store),
            continuations: Arc::new(continuations),
            email_transport: Arc::new(OutboxEmailTransport::new(settings.email_outbox_dir())),
            http: Arc::new(UreqHttpClient::new(HTTP_TIMEOUT)),
        };
        let state_root = settings.state_root.clone();
        let mut engine = Self::assemble(settings, parts);
        engine.state_root = Some(state_root);
        Ok(engine)
    }

    /// Wires the processor, driver, redrive and sandbox controllers around
    /// `parts`. Assembled engines write no engine log file.
    pub fn assemble(settings: Settings, parts: EngineParts) -> Self {
        let offloader = Arc::new(PayloadOffloader::from_settings(
            Arc::clone(&parts.blobs),
            &settings.offload,
        ));
        let logger = if settings.execution_logs.enabled {
            ExecutionLogger::new(Arc::clone(&parts.log_store), Some(Arc::clone(&offloader)))
        } else {
            ExecutionLogger::disabled()
        };
        let starter = Arc::new(QueuedFlowStarter::new());
        let adapters = Arc::new(LlmAdapterFactory::new(
            settings.providers.clone(),
            Arc::clone(&parts.http),
        ));
        let registry = StepHandlerRegistry::with_builtins(HandlerDependencies {
            definitions: Arc::clone(&parts.definitions),
            adapters,
            http: Arc::clone(&parts.http),
            offloader: Some(Arc::clone(&offloader)),
            email_transport: parts.email_transport,
            flow_starter: starter.clone(),
            max_attachment_bytes: settings.email.max_attachment_bytes,
        });
        let processor = Arc::new(
            StepProcessor::new(Arc::clone(&parts.definitions), Arc::new(registry))
                .with_offloader(Arc::clone(&offloader))
                .with_logger(logger.clone())
                .with_content_retry_attempts(settings.orchestrator.step_retry.max_attempts),
        );
        let orchestrator = LocalOrchestrator::new(
            Arc::clone(&processor),
            FlowInitializer::new(Arc::clone(&parts.definitions), logger.clone()),
            FlowFinalizer::new(Some(Arc::clone(&offloader)), logger),
            parts.continuations,
            Arc::clone(&starter),
            settings.orchestrator.clone(),
        );
        let redrive = RedriveController::new(
            Arc::clone(&parts.log_store),
            Some(offloader),
            starter.clone(),
        );
        Self {
            settings,
            state_root: None,
            log_store: parts.log_store,
            starter,
            orchestrator,
            redrive,
            sandbox: SandboxController::new(processor),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn log_store(&self) -> &Arc<dyn ExecutionLogStore> {
        &self.log_store
    }

    pub fn orchestrator(&self) -> &LocalOrchestrator {
        &self.orchestrator
    }

    pub fn sandbox(&self) -> &SandboxController {
        &self.sandbox
    }

    pub fn run(&self, trigger: FlowTriggerInput) -> Result<EngineRun, StepError> {
        let outcome = self.orchestrator.start(trigger)?;
        self.record_outcome("flow.run", &outcome);
        Ok(self.with_queued(outcome))
    }

    pub fn deliver_event(
        &self,
        correlation_key: &str,
        payload: Value,
    ) -> Result<EngineRun, StepError> {
        let outcome = self.orchestrator.deliver_event(correlation_key, payload)?;
        self.record_outcome("flow.event", &outcome);
        Ok(self.with_queued(outcome))
    }

    pub fn expire_waits(&self, now: DateTime<Utc>) -> Result<Vec<RunOutcome>, StepError> {
        let outcomes = self.orchestrator.expire_waits(now)?;
        for outcome in &outcomes {
            self.record_outcome("flow.wait_expired", outcome);
        }
        Ok(outcomes)
    }

    /// Re-runs an execution from its original trigger.
    pub fn simple_redrive(&self, original_flow_execution_id: &str) -> Result<EngineRun, StepError> {
        let new_id = self.redrive.simple_redrive(original_flow_execution_id)?;
        self.drive_submitted(&new_id)
    }

    pub fn stateful_redrive(
        &self,
        original_flow_execution_id: &str,
        step_instance_id: &str,
        context_override: Option<Map<String, Value>>,
    ) -> Result<EngineRun, StepError> {
        let new_id = self.redrive.stateful_redrive(
            original_flow_execution_id,
            step_instance_id,
            context_override,
        )?;
        self.drive_submitted(&new_id)
    }

    fn drive_submitted(&self, flow_execution_id: &str) -> Result<EngineRun, StepError> {
        let mut queued = self.orchestrator.run_queued();
        let position = queued.iter().position(|result| {
            result
                .as_ref()
                .is_ok_and(|outcome| outcome.flow_execution_id() == flow_execution_id)
        });
        let Some(index) = position else {
            return Err(StepError::transient(format!(
                "redrive `{flow_execution_id}` was submitted but did not run"
            )));
        };
        let outcome = queued.remove(index)?;
        self.record_outcome("flow.redrive", &outcome);
        Ok(EngineRun { outcome, queued })
    }

    fn with_queued(&self, outcome: RunOutcome) -> EngineRun {
        let queued = if self.starter.pending() > 0 {
            self.orchestrator.run_queued()
        } else {
            Vec::new()
        };
        EngineRun { outcome, queued }
    }

    fn record_outcome(&self, event: &str, outcome: &RunOutcome) {
        let Some(state_root) = self.state_root.as_ref() else {
            return;
        };
        let state = outcome.state();
        let fields = json!({
            "flowExecutionId": state.flow_execution_id,
            "flowDefinitionId": state.flow_definition_id,
            "flowDefinitionVersion": state.flow_definition_version,
            "status": state.status.as_str(),
        });
        if let Err(err) = append_engine_log_event(state_root, event, fields) {
            tracing::warn!(event, error = %err, "failed to append engine log event");
        }
    }
}

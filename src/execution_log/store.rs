use super::record::{
    step_sort_key, ExecutionMetadataRecord, FinalStatusUpdate, StepEventStatus,
    StepExecutionRecord, METADATA_SORT_KEY,
};
use crate::shared::ids::now_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionLogError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create execution log database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("execution log record could not be encoded or decoded: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("no metadata record for flow execution `{flow_execution_id}`")]
    MetadataNotFound { flow_execution_id: String },
    #[error("execution log store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for ExecutionLogError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sql { source }
    }
}

impl From<serde_json::Error> for ExecutionLogError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json { source }
    }
}

/// Append-only log keyed by `(flowExecutionId, sortKey)`. Duplicate appends
/// are ignored; only the metadata record's terminal fields are ever updated.
pub trait ExecutionLogStore: Send + Sync {
    /// Returns `false` when a metadata record already existed.
    fn put_metadata(&self, record: &ExecutionMetadataRecord) -> Result<bool, ExecutionLogError>;

    /// Returns `false` when an identical key was already written.
    fn append_step_record(&self, record: &StepExecutionRecord) -> Result<bool, ExecutionLogError>;

    fn update_final_status(&self, update: &FinalStatusUpdate) -> Result<(), ExecutionLogError>;

    fn get_metadata(
        &self,
        flow_execution_id: &str,
    ) -> Result<Option<ExecutionMetadataRecord>, ExecutionLogError>;

    /// Step records in sort-key order.
    fn list_step_records(
        &self,
        flow_execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, ExecutionLogError>;

    fn latest_step_record(
        &self,
        flow_execution_id: &str,
        step_instance_id: &str,
        status: StepEventStatus,
    ) -> Result<Option<StepExecutionRecord>, ExecutionLogError> {
        Ok(self
            .list_step_records(flow_execution_id)?
            .into_iter()
            .rev()
            .find(|record| record.step_instance_id == step_instance_id && record.status == status))
    }
}

fn apply_final_status(record: &mut ExecutionMetadataRecord, update: &FinalStatusUpdate) {
    record.status = update.status;
    record.end_time = Some(update.end_time.clone());
    record.final_context_data_s3_pointer = update.final_context_data_s3_pointer.clone();
    record.error_info = update.error_info.clone();
}

pub struct SqliteExecutionLogStore {
    db_path: PathBuf,
}

impl SqliteExecutionLogStore {
    pub fn open(db_path: &Path) -> Result<Self, ExecutionLogError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ExecutionLogError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<(), ExecutionLogError> {
        let connection = self.connect()?;
        connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS execution_log (
                flow_execution_id TEXT NOT NULL,
                sort_key TEXT NOT NULL,
                record_type TEXT NOT NULL,
                status TEXT NOT NULL,
                step_instance_id TEXT,
                payload TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (flow_execution_id, sort_key)
            );

            CREATE INDEX IF NOT EXISTS idx_execution_log_step
                ON execution_log (flow_execution_id, step_instance_id, status);
            ",
        )?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, ExecutionLogError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| ExecutionLogError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(connection)
    }
}

impl ExecutionLogStore for SqliteExecutionLogStore {
    fn put_metadata(&self, record: &ExecutionMetadataRecord) -> Result<bool, ExecutionLogError> {
        let payload = serde_json::to_string(record)?;
        let inserted = self.connect()?.execute(
            "INSERT OR IGNORE INTO execution_log
                (flow_execution_id, sort_key, record_type, status,
                 step_instance_id, payload, written_at)
             VALUES (?1, ?2, 'METADATA', ?3, NULL, ?4, ?5)",
            params![
                record.flow_execution_id,
                METADATA_SORT_KEY,
                record.status.as_str(),
                payload,
                now_rfc3339()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn append_step_record(&self, record: &StepExecutionRecord) -> Result<bool, ExecutionLogError> {
        let payload = serde_json::to_string(record)?;
        let inserted = self.connect()?.execute(
            "INSERT OR IGNORE INTO execution_log
                (flow_execution_id, sort_key, record_type, status,
                 step_instance_id, payload, written_at)
             VALUES (?1, ?2, 'STEP', ?3, ?4, ?5, ?6)",
            params![
                record.flow_execution_id,
                step_sort_key(record),
                record.status.as_str(),
                record.step_instance_id,
                payload,
                now_rfc3339()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn update_final_status(&self, update: &FinalStatusUpdate) -> Result<(), ExecutionLogError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let payload: Option<String> = transaction
            .query_row(
                "SELECT payload FROM execution_log WHERE flow_execution_id = ?1 AND sort_key = ?2",
                params![update.flow_execution_id, METADATA_SORT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let Some(payload) = payload else {
            return Err(ExecutionLogError::MetadataNotFound {
                flow_execution_id: update.flow_execution_id.clone(),
            });
        };
        let mut record: ExecutionMetadataRecord = serde_json::from_str(&payload)?;
        apply_final_status(&mut record, update);
        transaction.execute(
            "UPDATE execution_log SET payload = ?1, status = ?2, written_at = ?3
             WHERE flow_execution_id = ?4 AND sort_key = ?5",
            params![
                serde_json::to_string(&record)?,
                record.status.as_str(),
                now_rfc3339(),
                update.flow_execution_id,
                METADATA_SORT_KEY
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    fn get_metadata(
        &self,
        flow_execution_id: &str,
    ) -> Result<Option<ExecutionMetadataRecord>, ExecutionLogError> {
        let payload: Option<String> = self
            .connect()?
            .query_row(
                "SELECT payload FROM execution_log WHERE flow_execution_id = ?1 AND sort_key = ?2",
                params![flow_execution_id, METADATA_SORT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| serde_json::from_str(&raw).map_err(ExecutionLogError::from))
            .transpose()
    }

    fn list_step_records(
        &self,
        flow_execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, ExecutionLogError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT payload FROM execution_log
             WHERE flow_execution_id = ?1 AND record_type = 'STEP'
             ORDER BY sort_key ASC",
        )?;
        let rows = statement.query_map(params![flow_execution_id], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}

#[derive(Debug, Default)]
struct InMemoryLog {
    metadata: BTreeMap<String, ExecutionMetadataRecord>,
    steps: BTreeMap<(String, String), StepExecutionRecord>,
}

/// Process-local store, mainly for tests and sandbox wiring.
#[derive(Debug, Default)]
pub struct InMemoryExecutionLogStore {
    log: Mutex<InMemoryLog>,
    writes: AtomicUsize,
}

impl InMemoryExecutionLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write call received, including ignored duplicates.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryLog>, ExecutionLogError> {
        self.log
            .lock()
            .map_err(|_| ExecutionLogError::Unavailable("execution log lock poisoned".to_string()))
    }
}

impl ExecutionLogStore for InMemoryExecutionLogStore {
    fn put_metadata(&self, record: &ExecutionMetadataRecord) -> Result<bool, ExecutionLogError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut log = self.lock()?;
        if log.metadata.contains_key(&record.flow_execution_id) {
            return Ok(false);
        }
        log.metadata
            .insert(record.flow_execution_id.clone(), record.clone());
        Ok(true)
    }

    fn append_step_record(&self, record: &StepExecutionRecord) -> Result<bool, ExecutionLogError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = (record.flow_execution_id.clone(), step_sort_key(record));
        let mut log = self.lock()?;
        if log.steps.contains_key(&key) {
            return Ok(false);
        }
        log.steps.insert(key, record.clone());
        Ok(true)
    }

    fn update_final_status(&self, update: &FinalStatusUpdate) -> Result<(), ExecutionLogError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut log = self.lock()?;
        let record = log
            .metadata
            .get_mut(&update.flow_execution_id)
            .ok_or_else(|| ExecutionLogError::MetadataNotFound {
                flow_execution_id: update.flow_execution_id.clone(),
            })?;
        apply_final_status(record, update);
        Ok(())
    }

    fn get_metadata(
        &self,
        flow_execution_id: &str,
    ) -> Result<Option<ExecutionMetadataRecord>, ExecutionLogError> {
        Ok(self.lock()?.metadata.get(flow_execution_id).cloned())
    }

    fn list_step_records(
        &self,
        flow_execution_id: &str,
    ) -> Result<Vec<StepExecutionRecord>, ExecutionLogError> {
        Ok(self
            .lock()?
            .steps
            .iter()
            .filter(|((id, _), _)| id == flow_execution_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

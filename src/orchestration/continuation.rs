use super::error::StepError;
use super::state::FlowRuntimeState;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ContinuationError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create continuation database parent {path}: {source}")]
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
    #[error("continuation state could not be encoded or decoded: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("correlation key `{0}` is already awaited by another execution")]
    DuplicateKey(String),
    #[error("continuation store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for ContinuationError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sql { source }
    }
}

impl From<serde_json::Error> for ContinuationError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json { source }
    }
}

impl From<ContinuationError> for StepError {
    fn from(value: ContinuationError) -> Self {
        match value {
            ContinuationError::Json { .. } | ContinuationError::DuplicateKey(_) => {
                Self::permanent(value.to_string())
            }
            other => Self::transient(other.to_string()),
        }
    }
}

/// A parked flow waiting for the event with its correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub correlation_key: String,
    pub token: String,
    pub flow_execution_id: String,
    pub created_at: String,
    pub state: FlowRuntimeState,
}

/// Durable parking lot for WAIT states, keyed by correlation key.
pub trait ContinuationStore: Send + Sync {
    /// Parking the same token twice is a no-op; a different execution on the
    /// same key is rejected.
    fn park(&self, continuation: &Continuation) -> Result<(), ContinuationError>;

    /// Removes and returns the continuation for `correlation_key`.
    fn take(&self, correlation_key: &str) -> Result<Option<Continuation>, ContinuationError>;

    fn list(&self) -> Result<Vec<Continuation>, ContinuationError>;
}

#[derive(Debug, Default)]
pub struct InMemoryContinuationStore {
    parked: Mutex<BTreeMap<String, Continuation>>,
}

impl InMemoryContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Continuation>>, ContinuationError> {
        self.parked
            .lock()
            .map_err(|_| ContinuationError::Unavailable("continuation lock poisoned".to_string()))
    }
}

impl ContinuationStore for InMemoryContinuationStore {
    fn park(&self, continuation: &Continuation) -> Result<(), ContinuationError> {
        let mut parked = self.lock()?;
        if let Some(existing) = parked.get(&continuation.correlation_key) {
            if existing.token == continuation.token {
                return Ok(());
            }
            return Err(ContinuationError::DuplicateKey(
                continuation.correlation_key.clone(),
            ));
        }
        parked.insert(continuation.correlation_key.clone(), continuation.clone());
        Ok(())
    }

    fn take(&self, correlation_key: &str) -> Result<Option<Continuation>, ContinuationError> {
        Ok(self.lock()?.remove(correlation_key))
    }

    fn list(&self) -> Result<Vec<Continuation>, ContinuationError> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

pub struct SqliteContinuationStore {
    db_path: PathBuf,
}

impl SqliteContinuationStore {
    pub fn open(db_path: &Path) -> Result<Self, ContinuationError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ContinuationError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.connect()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS continuations (
                correlation_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                flow_execution_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL
            );
            ",
        )?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, ContinuationError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| ContinuationError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(connection)
    }
}

fn decode_row(
    correlation_key: String,
    token: String,
    flow_execution_id: String,
    created_at: String,
    state: &str,
) -> Result<Continuation, ContinuationError> {
    Ok(Continuation {
        correlation_key,
        token,
        flow_execution_id,
        created_at,
        state: serde_json::from_str(state)?,
    })
}

impl ContinuationStore for SqliteContinuationStore {
    fn park(&self, continuation: &Continuation) -> Result<(), ContinuationError> {
        let state = serde_json::to_string(&continuation.state)?;
        let connection = self.connect()?;
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO continuations
                (correlation_key, token, flow_execution_id, created_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                continuation.correlation_key,
                continuation.token,
                continuation.flow_execution_id,
                continuation.created_at,
                state
            ],
        )?;
        if inserted > 0 {
            return Ok(());
        }
        let existing: Option<String> = connection
            .query_row(
                "SELECT token FROM continuations WHERE correlation_key = ?1",
                params![continuation.correlation_key],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(token) if token == continuation.token => Ok(()),
            _ => Err(ContinuationError::DuplicateKey(
                continuation.correlation_key.clone(),
            )),
        }
    }

    fn take(&self, correlation_key: &str) -> Result<Option<Continuation>, ContinuationError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let row: Option<(String, String, String, String)> = transaction
            .query_row(
                "SELECT token, flow_execution_id, created_at, state
                 FROM continuations WHERE correlation_key = ?1",
                params![correlation_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((token, flow_execution_id, created_at, state)) = row else {
            return Ok(None);
        };
        transaction.execute(
            "DELETE FROM continuations WHERE correlation_key = ?1",
            params![correlation_key],
        )?;
        transaction.commit()?;
        decode_row(
            correlation_key.to_string(),
            token,
            flow_execution_id,
            created_at,
            &state,
        )
        .map(Some)
    }

    fn list(&self) -> Result<Vec<Continuation>, ContinuationError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT correlation_key, token, flow_execution_id, created_at, state
             FROM continuations ORDER BY created_at ASC, correlation_key ASC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut parked = Vec::new();
        for row in rows {
            let (key, token, execution_id, created_at, state) = row?;
            parked.push(decode_row(key, token, execution_id, created_at, &state)?);
        }
        Ok(parked)
    }
}

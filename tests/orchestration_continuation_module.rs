use allma::orchestration::{
    Continuation, ContinuationError, ContinuationStore, FlowRuntimeState, InMemoryContinuationStore,
    SqliteContinuationStore,
};
use serde_json::json;
use tempfile::tempdir;

fn parked(key: &str, token: &str, execution: &str, created_at: &str) -> Continuation {
    let state: FlowRuntimeState = serde_json::from_value(json!({
        "flowExecutionId": execution,
        "flowDefinitionId": "approvals",
        "flowDefinitionVersion": 2,
        "currentStepInstanceId": "await_approval",
        "status": "RUNNING",
        "startTime": "2026-01-05T10:00:00Z",
        "currentContextData": {"ticket": {"id": 42}},
        "_internal": {"pendingWait": {
            "correlationKey": key,
            "token": token,
            "stepInstanceId": "await_approval",
            "requestedAt": created_at,
            "timeoutSeconds": 3600
        }}
    }))
    .expect("state json");
    Continuation {
        correlation_key: key.to_string(),
        token: token.to_string(),
        flow_execution_id: execution.to_string(),
        created_at: created_at.to_string(),
        state,
    }
}

fn exercise(store: &dyn ContinuationStore) {
    let first = parked("approval-42", "tok-a", "exec-1", "2026-01-05T10:00:01Z");
    let second = parked("approval-7", "tok-b", "exec-2", "2026-01-05T09:00:00Z");
    store.park(&first).expect("park first");
    store.park(&second).expect("park second");

    store.park(&first).expect("same token parks idempotently");
    let clash = parked("approval-42", "tok-z", "exec-9", "2026-01-05T11:00:00Z");
    assert!(matches!(
        store.park(&clash),
        Err(ContinuationError::DuplicateKey(key)) if key == "approval-42"
    ));

    let keys: Vec<String> = store
        .list()
        .expect("list")
        .into_iter()
        .map(|continuation| continuation.correlation_key)
        .collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&"approval-42".to_string()));

    let taken = store.take("approval-42").expect("take").expect("present");
    assert_eq!(taken, first);
    assert_eq!(
        taken.state.internal.pending_wait.map(|wait| wait.timeout_seconds),
        Some(Some(3600))
    );
    assert!(store.take("approval-42").expect("second take").is_none());
    assert!(store.take("never-parked").expect("unknown").is_none());
    assert_eq!(store.list().expect("list after take").len(), 1);
}

#[test]
fn continuation_module_in_memory_store() {
    exercise(&InMemoryContinuationStore::new());
}

#[test]
fn continuation_module_sqlite_store() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteContinuationStore::open(&dir.path().join("state/continuations.db"))
        .expect("open");
    exercise(&store);
}

#[test]
fn continuation_module_sqlite_survives_reopen_and_orders_by_creation() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("continuations.db");
    {
        let store = SqliteContinuationStore::open(&path).expect("open");
        store
            .park(&parked("late", "t1", "exec-1", "2026-01-05T12:00:00Z"))
            .expect("park late");
        store
            .park(&parked("early", "t2", "exec-2", "2026-01-05T08:00:00Z"))
            .expect("park early");
    }

    let reopened = SqliteContinuationStore::open(&path).expect("reopen");
    assert_eq!(reopened.db_path(), path.as_path());
    let keys: Vec<String> = reopened
        .list()
        .expect("list")
        .into_iter()
        .map(|continuation| continuation.correlation_key)
        .collect();
    assert_eq!(keys, vec!["early".to_string(), "late".to_string()]);
}

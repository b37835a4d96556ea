use crate::app::command_support::render_json;
use crate::config::load_settings;
use crate::execution_log::{ExecutionLogStore, SqliteExecutionLogStore};
use serde_json::json;
use std::path::Path;

pub fn cmd_executions(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    match args {
        [verb, execution_id] if verb == "show" => {
            let settings = load_settings(config).map_err(|e| e.to_string())?;
            let store = SqliteExecutionLogStore::open(&settings.execution_log_database_path())
                .map_err(|e| e.to_string())?;
            let metadata = store
                .get_metadata(execution_id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("unknown flow execution `{execution_id}`"))?;
            let steps = store
                .list_step_records(execution_id)
                .map_err(|e| e.to_string())?;
            render_json(&json!({ "metadata": metadata, "steps": steps }))
        }
        _ => Err("usage: executions show <execution_id>".to_string()),
    }
}

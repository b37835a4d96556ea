use chrono::{SecondsFormat, Utc};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/'))
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-', '_', '.' or '/'"
    ))
}

pub fn new_flow_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Folds a module identifier or system step id into a comparable form:
/// `system/data-join`, `System_Data_Join` and `system-data-join` all become
/// `system-data-join`.
pub fn normalize_module_identifier(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| match ch {
            '/' | '_' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Accepts either a JSON number or a string and hands the textual form to
/// `parser`. Versions arrive as `3`, `"3"` or `"LATEST_PUBLISHED"`.
pub fn parse_number_or_string<'de, D, T, F>(
    deserializer: D,
    kind: &str,
    parser: F,
) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    F: FnOnce(&str) -> Result<T, String>,
{
    let raw = Value::deserialize(deserializer)?;
    let text = match &raw {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        other => {
            return Err(D::Error::custom(format!(
                "invalid {kind}: expected number or string, got {other}"
            )))
        }
    };
    parser(&text).map_err(|err| D::Error::custom(format!("invalid {kind} `{text}`: {err}")))
}

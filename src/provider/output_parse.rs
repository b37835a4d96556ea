use serde_json::Value;

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parses model output that must be JSON. A single surrounding markdown
/// fence (```json ... ```) is tolerated; anything else is rejected.
pub fn parse_strict_json(text: &str) -> Result<Value, String> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err("model returned an empty response".to_string());
    }
    serde_json::from_str(body).map_err(|err| format!("model output is not valid JSON: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_plain_and_fenced_json() {
        assert_eq!(
            parse_strict_json(" {\"a\": 1} ").expect("plain"),
            json!({"a": 1})
        );
        assert_eq!(
            parse_strict_json("```json\n[1, 2]\n```").expect("fenced"),
            json!([1, 2])
        );
    }

    #[test]
    fn rejects_prose_and_empty_output() {
        assert!(parse_strict_json("Sure! Here is the JSON: {").is_err());
        assert!(parse_strict_json("```\n```").is_err());
    }
}

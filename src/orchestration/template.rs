use super::json_path::get_path;
use serde_json::Value;

/// Replaces every `{{ path }}` placeholder through `resolve`.
pub fn render_template_with_placeholders<F>(
    template: &str,
    mut resolve: F,
) -> Result<String, String>
where
    F: FnMut(&str) -> Result<String, String>,
{
    let mut rendered = String::new();
    let mut cursor = template;

    while let Some(start) = cursor.find("{{") {
        rendered.push_str(&cursor[..start]);
        let after_open = &cursor[start + 2..];
        let Some(close_offset) = after_open.find("}}") else {
            return Err("unclosed placeholder in template".to_string());
        };
        let token = after_open[..close_offset].trim();
        if token.is_empty() {
            return Err("empty placeholder in template".to_string());
        }
        rendered.push_str(&resolve(token)?);
        cursor = &after_open[close_offset + 2..];
    }

    rendered.push_str(cursor);
    Ok(rendered)
}

/// Strings render bare, everything else as compact JSON.
pub fn value_to_template_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Renders placeholders as JSON paths into `context`. A missing value is an
/// error naming the placeholder.
pub fn render_against(template: &str, context: &Value) -> Result<String, String> {
    render_template_with_placeholders(template, |token| {
        let value = get_path(context, token).map_err(|err| err.to_string())?;
        value
            .map(value_to_template_text)
            .ok_or_else(|| format!("template placeholder `{{{{{token}}}}}` has no value"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_strings_bare_and_other_values_as_json() {
        let context = json!({"name": "Ada", "order": {"items": [1, 2]}});
        let rendered =
            render_against("Hi {{ name }}: {{order.items}}", &context).expect("render");
        assert_eq!(rendered, "Hi Ada: [1,2]");
    }

    #[test]
    fn missing_placeholder_values_are_errors() {
        let err = render_against("{{ missing }}", &json!({})).expect_err("missing");
        assert!(err.contains("missing"));
        assert!(render_against("{{ open", &json!({})).is_err());
    }
}

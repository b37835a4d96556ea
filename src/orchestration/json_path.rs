//! The small JSONPath subset used by mappings, templates and conditions:
//! `$`, `$.a.b`, `a.b`, `items[0]`, `$['odd key']`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid json path `{path}`: {reason}")]
pub struct JsonPathError {
    pub path: String,
    pub reason: String,
}

pub fn parse_path(raw: &str) -> Result<Vec<PathSegment>, JsonPathError> {
    let invalid = |reason: &str| JsonPathError {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("path is empty"));
    }
    let mut rest = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed `[`"))?;
            let inner = after[..close].trim();
            if let Some(quoted) = inner
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
            {
                segments.push(PathSegment::Key(quoted.to_string()));
            } else {
                let index = inner
                    .parse::<usize>()
                    .map_err(|_| invalid("bracket segments must be an index or a quoted key"))?;
                segments.push(PathSegment::Index(index));
            }
            rest = &after[close + 1..];
            continue;
        }
        let body = rest.strip_prefix('.').unwrap_or(rest);
        let end = body.find(['.', '[']).unwrap_or(body.len());
        let key = body[..end].trim();
        if key.is_empty() {
            return Err(invalid("empty key segment"));
        }
        segments.push(PathSegment::Key(key.to_string()));
        rest = &body[end..];
    }
    Ok(segments)
}

pub fn get<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| match segment {
            PathSegment::Key(key) => current.as_object()?.get(key),
            PathSegment::Index(index) => current.as_array()?.get(*index),
        })
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, JsonPathError> {
    Ok(get(root, &parse_path(path)?))
}

/// Writes `value` at `segments`, creating intermediate objects. Existing
/// non-container values along the way are replaced by objects.
pub fn set(root: &mut Value, segments: &[PathSegment], value: Value) -> Result<(), JsonPathError> {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        current = match segment {
            PathSegment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                match current {
                    Value::Object(object) => object
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new())),
                    _ => {
                        return Err(JsonPathError {
                            path: describe(segments),
                            reason: format!("`{key}` parent is not an object"),
                        })
                    }
                }
            }
            PathSegment::Index(index) => {
                let len = current.as_array().map(Vec::len).unwrap_or(0);
                current
                    .as_array_mut()
                    .and_then(|items| items.get_mut(*index))
                    .ok_or_else(|| JsonPathError {
                        path: describe(segments),
                        reason: format!("index {index} is out of bounds (len {len})"),
                    })?
            }
        };
    }

    match last {
        PathSegment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            if let Value::Object(object) = current {
                object.insert(key.clone(), value);
            }
            Ok(())
        }
        PathSegment::Index(index) => {
            let items = current.as_array_mut().ok_or_else(|| JsonPathError {
                path: describe(segments),
                reason: "cannot index into a non-array value".to_string(),
            })?;
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[*index] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    return Err(JsonPathError {
                        path: describe(segments),
                        reason: format!("index {index} is out of bounds (len {})", items.len()),
                    })
                }
            }
            Ok(())
        }
    }
}

pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), JsonPathError> {
    set(root, &parse_path(path)?, value)
}

/// Same as [`set_path`] for a context map.
pub fn set_in_map(
    root: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<(), JsonPathError> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        return Err(JsonPathError {
            path: path.to_string(),
            reason: "cannot replace the root of the context".to_string(),
        });
    }
    let mut wrapped = Value::Object(std::mem::take(root));
    let outcome = set(&mut wrapped, &segments, value);
    if let Value::Object(object) = wrapped {
        *root = object;
    }
    outcome
}

fn describe(segments: &[PathSegment]) -> String {
    let mut out = String::from("$");
    for segment in segments {
        match segment {
            PathSegment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            PathSegment::Index(index) => out.push_str(&format!("[{index}]")),
        }
    }
    out
}

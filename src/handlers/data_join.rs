use super::csv::csv_to_records;
use super::{StepHandler, StepHandlerOutput};
use crate::definition::ResolvedStep;
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Outer,
}

type Row = Map<String, Value>;

fn records(label: &str, value: Option<&Value>) -> Result<Vec<Row>, StepError> {
    match value {
        Some(Value::String(text)) => csv_to_records(text)
            .map_err(|reason| StepError::permanent(format!("{label} is not valid CSV: {reason}"))),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.as_object().cloned().ok_or_else(|| {
                    StepError::permanent(format!("{label}[{index}] is not an object"))
                })
            })
            .collect(),
        Some(_) => Err(StepError::permanent(format!(
            "{label} must be CSV text or an array of objects"
        ))),
        None => Err(StepError::permanent(format!("{label} is required"))),
    }
}

fn columns(rows: &[Row]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                ordered.push(key.clone());
            }
        }
    }
    ordered
}

fn key_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Rows missing any key column never match.
fn row_key(row: &Row, keys: &[String]) -> Option<Vec<String>> {
    keys.iter()
        .map(|key| row.get(key).filter(|v| !v.is_null()).map(key_text))
        .collect()
}

struct JoinLayout<'a> {
    keys: &'a [String],
    left_columns: Vec<String>,
    right_columns: Vec<String>,
    colliding: BTreeSet<String>,
}

impl JoinLayout<'_> {
    fn combine(&self, left: Option<&Row>, right: Option<&Row>) -> Value {
        let mut out = Map::new();
        for key in self.keys {
            let value = left
                .and_then(|row| row.get(key))
                .or_else(|| right.and_then(|row| row.get(key)))
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(key.clone(), value);
        }
        for column in &self.left_columns {
            let name = if self.colliding.contains(column) {
                format!("{column}_left")
            } else {
                column.clone()
            };
            let value = left.and_then(|row| row.get(column)).cloned();
            out.insert(name, value.unwrap_or(Value::Null));
        }
        for column in &self.right_columns {
            let name = if self.colliding.contains(column) {
                format!("{column}_right")
            } else {
                column.clone()
            };
            let value = right.and_then(|row| row.get(column)).cloned();
            out.insert(name, value.unwrap_or(Value::Null));
        }
        Value::Object(out)
    }
}

/// Joins `left` and `right` on `keys`. Non-key columns present on both sides
/// are renamed `<col>_left` and `<col>_right`; the side without a match is
/// null-filled.
pub fn join_rows(left: &[Row], right: &[Row], keys: &[String], join_type: JoinType) -> Vec<Value> {
    let non_key = |cols: Vec<String>| -> Vec<String> {
        cols.into_iter().filter(|c| !keys.contains(c)).collect()
    };
    let left_columns = non_key(columns(left));
    let right_columns = non_key(columns(right));
    let colliding = left_columns
        .iter()
        .filter(|c| right_columns.contains(c))
        .cloned()
        .collect();
    let layout = JoinLayout {
        keys,
        left_columns,
        right_columns,
        colliding,
    };

    let index = |rows: &[Row]| {
        let mut map: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
        for (position, row) in rows.iter().enumerate() {
            if let Some(key) = row_key(row, keys) {
                map.entry(key).or_default().push(position);
            }
        }
        map
    };

    let mut joined = Vec::new();
    if join_type == JoinType::Right {
        let left_index = index(left);
        for right_row in right {
            let matches = row_key(right_row, keys).and_then(|key| left_index.get(&key));
            match matches {
                Some(positions) => joined.extend(
                    positions
                        .iter()
                        .map(|&p| layout.combine(Some(&left[p]), Some(right_row))),
                ),
                None => joined.push(layout.combine(None, Some(right_row))),
            }
        }
        return joined;
    }

    let right_index = index(right);
    let mut right_matched = vec![false; right.len()];
    for left_row in left {
        let matches = row_key(left_row, keys).and_then(|key| right_index.get(&key));
        match matches {
            Some(positions) => {
                for &position in positions {
                    right_matched[position] = true;
                    joined.push(layout.combine(Some(left_row), Some(&right[position])));
                }
            }
            None if matches!(join_type, JoinType::Left | JoinType::Outer) => {
                joined.push(layout.combine(Some(left_row), None));
            }
            None => {}
        }
    }
    if join_type == JoinType::Outer {
        for (position, right_row) in right.iter().enumerate() {
            if !right_matched[position] {
                joined.push(layout.combine(None, Some(right_row)));
            }
        }
    }
    joined
}

fn join_keys(
    input: &Map<String, Value>,
    config: &Map<String, Value>,
) -> Result<Vec<String>, StepError> {
    let raw = input
        .get("joinKeys")
        .or_else(|| input.get("joinKey"))
        .or_else(|| config.get("joinKeys"))
        .or_else(|| config.get("joinKey"));
    let keys: Vec<String> = match raw {
        Some(Value::String(key)) => vec![key.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| StepError::permanent("joinKeys must be strings"))
            })
            .collect::<Result<_, _>>()?,
        _ => Vec::new(),
    };
    if keys.is_empty() {
        return Err(StepError::permanent("data join needs at least one join key"));
    }
    Ok(keys)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataJoinHandler;

impl StepHandler for DataJoinHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let config = &step.base.custom_config;
        let left = records("leftData", input.get("leftData"))?;
        let right = records("rightData", input.get("rightData"))?;
        let keys = join_keys(input, config)?;
        let join_type = match input.get("joinType").or_else(|| config.get("joinType")) {
            Some(raw) => serde_json::from_value::<JoinType>(raw.clone()).map_err(|_| {
                StepError::permanent(format!(
                    "joinType must be inner, left, right or outer (got {raw})"
                ))
            })?,
            None => JoinType::default(),
        };

        let joined = join_rows(&left, &right, &keys, join_type);
        Ok(StepHandlerOutput::data(json!({
            "rowCount": joined.len(),
            "joinedData": joined,
        })))
    }
}

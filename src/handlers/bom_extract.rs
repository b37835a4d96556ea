use super::{StepHandler, StepHandlerOutput};
use crate::definition::ResolvedStep;
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// `A` is column 1, `AA` is 27.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, ch| {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = u32::from(ch.to_ascii_uppercase() as u8 - b'A' + 1);
        acc.checked_mul(26)?.checked_add(digit)
    })
}

/// Splits `B12` into `(column 2, row 12)`.
pub fn split_address(address: &str) -> Option<(u32, u32)> {
    let trimmed = address.trim().replace('$', "");
    let split = trimmed.find(|c: char| c.is_ascii_digit())?;
    let column = column_index(&trimmed[..split])?;
    let row = trimmed[split..].parse::<u32>().ok()?;
    Some((column, row))
}

fn cell_position(cell: &Map<String, Value>) -> Option<(u32, u32)> {
    if let Some(address) = cell
        .get("address")
        .or_else(|| cell.get("cell"))
        .and_then(Value::as_str)
    {
        return split_address(address);
    }
    let row = cell.get("row").and_then(Value::as_u64)? as u32;
    let column = match cell.get("col").or_else(|| cell.get("column"))? {
        Value::Number(number) => number.as_u64()? as u32,
        Value::String(letters) => column_index(letters.trim())?,
        _ => return None,
    };
    Some((column, row))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn row_number(
    input: &Map<String, Value>,
    config: &Map<String, Value>,
    name: &str,
) -> Result<Option<u32>, StepError> {
    match input.get(name).or_else(|| config.get(name)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .filter(|row| *row >= 1)
            .and_then(|row| u32::try_from(row).ok())
            .map(Some)
            .ok_or_else(|| {
                StepError::permanent(format!(
                    "`{name}` must be a positive row number no greater than {}",
                    u32::MAX
                ))
            }),
    }
}

/// Extracts a parts table from a sparse worksheet cell list
/// (`[{row, col, value}]` or `[{address, value}]`). The header row names the
/// columns; each non-empty row in the data range becomes one part, with
/// missing cells as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BomExtractHandler;

impl StepHandler for BomExtractHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let config = &step.base.custom_config;
        let cells = input
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::permanent("bom extraction needs a `cells` array"))?;
        let header_row = row_number(input, config, "headerRow")?
            .ok_or_else(|| StepError::permanent("bom extraction needs `headerRow`"))?;
        let data_start = match row_number(input, config, "dataStartRow")? {
            Some(row) => row,
            None => header_row.checked_add(1).ok_or_else(|| {
                StepError::permanent("`headerRow` leaves no room for data rows")
            })?,
        };
        let data_end = row_number(input, config, "dataEndRow")?;
        if data_start <= header_row {
            return Err(StepError::permanent(
                "`dataStartRow` must come after `headerRow`",
            ));
        }

        let mut grid: BTreeMap<u32, BTreeMap<u32, Value>> = BTreeMap::new();
        for (index, cell) in cells.iter().enumerate() {
            let object = cell
                .as_object()
                .ok_or_else(|| StepError::permanent(format!("cells[{index}] is not an object")))?;
            let (column, row) = cell_position(object).ok_or_else(|| {
                StepError::permanent(format!("cells[{index}] has no usable row/column"))
            })?;
            let value = object.get("value").cloned().unwrap_or(Value::Null);
            grid.entry(row).or_default().insert(column, value);
        }

        let headers: Vec<(u32, String)> = grid
            .get(&header_row)
            .map(|row| {
                row.iter()
                    .filter(|(_, value)| !is_blank(value))
                    .map(|(column, value)| {
                        let name = match value {
                            Value::String(text) => text.trim().to_string(),
                            other => other.to_string(),
                        };
                        (*column, name)
                    })
                    .collect()
            })
            .unwrap_or_default();
        if headers.is_empty() {
            return Err(StepError::permanent(format!(
                "header row {header_row} has no populated cells"
            )));
        }

        let last_row = data_end.unwrap_or_else(|| grid.keys().next_back().copied().unwrap_or(0));
        let mut parts = Vec::new();
        for (_, row) in grid.range(data_start..=last_row.max(data_start)) {
            let populated = headers
                .iter()
                .any(|(column, _)| row.get(column).is_some_and(|v| !is_blank(v)));
            if !populated {
                continue;
            }
            let part: Map<String, Value> = headers
                .iter()
                .map(|(column, name)| {
                    let value = row
                        .get(column)
                        .filter(|v| !is_blank(v))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (name.clone(), value)
                })
                .collect();
            parts.push(Value::Object(part));
        }

        let header_names: Vec<&str> = headers.iter().map(|(_, name)| name.as_str()).collect();
        Ok(StepHandlerOutput::data(json!({
            "headers": header_names,
            "partCount": parts.len(),
            "parts": parts,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_split_into_column_and_row() {
        assert_eq!(split_address("A4"), Some((1, 4)));
        assert_eq!(split_address("$AB$10"), Some((28, 10)));
        assert_eq!(split_address("4A"), None);
        assert_eq!(column_index("Z"), Some(26));
    }
}

use serde_json::{Map, Value};

/// Splits RFC 4180 style text into rows of fields. Quoted fields may hold
/// commas, doubled quotes and line breaks; `\r\n` and `\n` both end a row.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, String> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                other => field.push(other),
            }
            continue;
        }
        match ch {
            '"' if !field_started => {
                in_quotes = true;
                field_started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                field_started = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                field_started = false;
                rows.push(std::mem::take(&mut row));
            }
            other => {
                field.push(other);
                field_started = true;
            }
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if field_started || !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|row| !(row.len() == 1 && row[0].is_empty()));
    Ok(rows)
}

/// First row is the header. Short rows are padded with empty strings;
/// surplus fields are an error.
pub fn csv_to_records(text: &str) -> Result<Vec<Map<String, Value>>, String> {
    let mut rows = parse_csv(text)?.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
    rows.enumerate()
        .map(|(index, row)| {
            if row.len() > header.len() {
                return Err(format!(
                    "row {} has {} fields but the header has {}",
                    index + 2,
                    row.len(),
                    header.len()
                ));
            }
            Ok(header
                .iter()
                .enumerate()
                .map(|(column, name)| {
                    let value = row.get(column).cloned().unwrap_or_default();
                    (name.clone(), Value::String(value))
                })
                .collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_fields_keep_commas_quotes_and_newlines() {
        let rows = parse_csv("id,note\r\n1,\"a, \"\"quoted\"\"\nline\"\n2,plain\n").expect("csv");
        assert_eq!(
            rows,
            vec![
                vec!["id".to_string(), "note".to_string()],
                vec!["1".to_string(), "a, \"quoted\"\nline".to_string()],
                vec!["2".to_string(), "plain".to_string()],
            ]
        );
    }

    #[test]
    fn unterminated_quotes_are_rejected() {
        assert!(parse_csv("a,\"b").is_err());
    }

    #[test]
    fn records_pad_short_rows() {
        let records = csv_to_records("a,b\n1\n").expect("records");
        assert_eq!(records[0]["a"], Value::String("1".to_string()));
        assert_eq!(records[0]["b"], Value::String(String::new()));
    }
}

/// Splits a comma or semicolon separated address list. Separators inside
/// double quotes or angle brackets do not split, so
/// `"Doe, Jane" <jane@example.com>` stays one address.
pub fn split_address_list(raw: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut angle_depth = 0usize;
    let mut escaped = false;

    for ch in raw.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                escaped = true;
                current.push(ch);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                angle_depth += 1;
                current.push(ch);
            }
            '>' if !in_quotes => {
                angle_depth = angle_depth.saturating_sub(1);
                current.push(ch);
            }
            ',' | ';' if !in_quotes && angle_depth == 0 => {
                let address = current.trim();
                if !address.is_empty() {
                    addresses.push(address.to_string());
                }
                current.clear();
            }
            other => current.push(other),
        }
    }
    let address = current.trim();
    if !address.is_empty() {
        addresses.push(address.to_string());
    }
    addresses
}

/// The bare `local@domain` part of `Name <local@domain>` or `local@domain`.
pub fn mailbox(address: &str) -> &str {
    let trimmed = address.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => trimmed[open + 1..close].trim(),
        _ => trimmed,
    }
}

pub fn validate_address(address: &str) -> Result<(), String> {
    let mailbox = mailbox(address);
    let Some((local, domain)) = mailbox.rsplit_once('@') else {
        return Err(format!("`{address}` has no `@`"));
    };
    if local.is_empty() || local.contains(char::is_whitespace) {
        return Err(format!("`{address}` has an invalid local part"));
    }
    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !domain.contains('.') || !labels_ok {
        return Err(format!("`{address}` has an invalid domain"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_with_commas_are_not_split() {
        assert_eq!(
            split_address_list("\"Doe, Jane\" <jane@example.com>, bob@example.com; <c@x.io>"),
            vec![
                "\"Doe, Jane\" <jane@example.com>".to_string(),
                "bob@example.com".to_string(),
                "<c@x.io>".to_string(),
            ]
        );
    }

    #[test]
    fn validates_the_mailbox_part() {
        assert!(validate_address("\"Doe, Jane\" <jane@example.com>").is_ok());
        assert!(validate_address("jane@localhost").is_err());
        assert!(validate_address("not an address").is_err());
    }
}

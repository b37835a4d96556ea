use super::error::StepError;
use super::json_path::parse_path;
use super::mapping::lookup_resolving;
use crate::storage::PayloadOffloader;
use serde_json::Value;
use std::cmp::Ordering;

/// Decides whether a transition condition holds for the given mapping
/// context. Injected into the processor so the expression language can be
/// swapped without touching the state machine.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, context: &Value) -> Result<bool, StepError>;

    /// Evaluates with offloaded values in `context` read back through
    /// `offloader`. Evaluators that never look inside step outputs can keep
    /// the default, which ignores the offloader.
    fn evaluate_resolving(
        &self,
        condition: &str,
        context: &Value,
        _offloader: Option<&PayloadOffloader>,
    ) -> Result<bool, StepError> {
        self.evaluate(condition, context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
struct ParsedCondition {
    negated: bool,
    path: String,
    comparison: Option<(Operator, Value)>,
}

/// `[!]<jsonpath> [<op> <literal>]` with `op` one of `== != > >= < <=`.
/// A bare path tests truthiness. Literals are JSON, a single-quoted string,
/// or a bare word taken as a string. `true` and `false` alone are constants.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathConditionEvaluator;

impl ConditionEvaluator for JsonPathConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &Value) -> Result<bool, StepError> {
        self.evaluate_resolving(condition, context, None)
    }

    fn evaluate_resolving(
        &self,
        condition: &str,
        context: &Value,
        offloader: Option<&PayloadOffloader>,
    ) -> Result<bool, StepError> {
        let trimmed = condition.trim();
        match trimmed {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }
        let parsed = parse_condition(trimmed)?;
        let segments = parse_path(&parsed.path)
            .map_err(|err| StepError::permanent(format!("condition `{trimmed}`: {err}")))?;
        let value = lookup_resolving(context, &segments, offloader)
            .map_err(|err| StepError {
                message: format!("condition `{trimmed}`: {}", err.message),
                ..err
            })?
            .unwrap_or(Value::Null);

        let outcome = match &parsed.comparison {
            None => is_truthy(&value),
            Some((operator, literal)) => compare(&value, *operator, literal),
        };
        Ok(outcome != parsed.negated)
    }
}

fn parse_condition(raw: &str) -> Result<ParsedCondition, StepError> {
    let invalid = |reason: &str| StepError::permanent(format!("condition `{raw}` {reason}"));

    let (negated, body) = match raw.strip_prefix('!') {
        Some(rest) if !rest.starts_with('=') => (true, rest.trim_start()),
        _ => (false, raw),
    };
    if body.is_empty() {
        return Err(invalid("is empty"));
    }

    let Some((start, width, operator)) = find_operator(body) else {
        return Ok(ParsedCondition {
            negated,
            path: body.to_string(),
            comparison: None,
        });
    };
    let path = body[..start].trim();
    let literal = body[start + width..].trim();
    if path.is_empty() {
        return Err(invalid("has no left-hand path"));
    }
    if literal.is_empty() {
        return Err(invalid("has no right-hand value"));
    }
    Ok(ParsedCondition {
        negated,
        path: path.to_string(),
        comparison: Some((operator, parse_literal(literal))),
    })
}

fn find_operator(body: &str) -> Option<(usize, usize, Operator)> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    for (index, &byte) in bytes.iter().enumerate() {
        if let Some(open) = quote {
            if byte == open {
                quote = None;
            }
            continue;
        }
        match byte {
            b'\'' | b'"' => quote = Some(byte),
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b'=' | b'!' | b'<' | b'>' if depth == 0 => {
                let next_is_eq = bytes.get(index + 1) == Some(&b'=');
                let found = match (byte, next_is_eq) {
                    (b'=', true) => (2, Operator::Eq),
                    (b'!', true) => (2, Operator::Ne),
                    (b'>', true) => (2, Operator::Ge),
                    (b'<', true) => (2, Operator::Le),
                    (b'>', false) => (1, Operator::Gt),
                    (b'<', false) => (1, Operator::Lt),
                    _ => continue,
                };
                return Some((index, found.0, found.1));
            }
            _ => {}
        }
    }
    None
}

fn parse_literal(raw: &str) -> Value {
    if let Some(inner) = raw.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(object) => !object.is_empty(),
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.trim().parse().ok()?),
        (Value::String(a), Value::Number(b)) => {
            a.trim().parse::<f64>().ok()?.partial_cmp(&b.as_f64()?)
        }
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => ordering(left, right) == Some(Ordering::Equal),
        _ => left == right,
    }
}

fn compare(value: &Value, operator: Operator, literal: &Value) -> bool {
    match operator {
        Operator::Eq => loosely_equal(value, literal),
        Operator::Ne => !loosely_equal(value, literal),
        Operator::Gt => ordering(value, literal) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            ordering(value, literal),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => ordering(value, literal) == Some(Ordering::Less),
        Operator::Le => matches!(
            ordering(value, literal),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(condition: &str, context: &Value) -> bool {
        JsonPathConditionEvaluator
            .evaluate(condition, context)
            .expect("condition evaluates")
    }

    #[test]
    fn compares_numbers_strings_and_truthiness() {
        let context = json!({"score": 0.8, "tier": "gold", "tags": [], "flags": {"vip": true}});
        assert!(eval("$.score >= 0.5", &context));
        assert!(!eval("$.score < 0.5", &context));
        assert!(eval("$.tier == 'gold'", &context));
        assert!(eval("$.tier != \"silver\"", &context));
        assert!(eval("$.flags.vip", &context));
        assert!(eval("!$.tags", &context));
        assert!(!eval("$.missing", &context));
        assert!(eval("$.missing == null", &context));
        assert!(eval("true", &context));
    }

    #[test]
    fn bracketed_keys_may_contain_operator_characters() {
        let context = json!({"a>b": 3});
        assert!(eval("$['a>b'] > 2", &context));
    }

    #[test]
    fn malformed_conditions_are_permanent_errors() {
        let err = JsonPathConditionEvaluator
            .evaluate("$.a ==", &json!({}))
            .expect_err("missing literal");
        assert_eq!(err.kind, crate::orchestration::error::ErrorKind::Permanent);
    }
}

use crate::{NodeOutcome, RuntimeContext};
use serde_json::Value;

/// Single `key=literal` clause. No conjunctions, disjunctions, or arithmetic:
/// a condition is either `outcome=<literal>` or `context.<key>=<literal>`.
struct Clause<'a> {
    key: &'a str,
    value: &'a str,
}

pub fn validate_condition_expression(condition: &str) -> Result<(), String> {
    let clause = parse_clause(condition)?;
    if !is_condition_key(clause.key) {
        return Err(format!("condition key '{}' is invalid", clause.key));
    }
    if clause.value.trim().is_empty() {
        return Err(format!(
            "condition clause '{}={}' has empty value",
            clause.key, clause.value
        ));
    }
    Ok(())
}

pub fn evaluate_condition_expression(
    condition: &str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Result<bool, String> {
    let clause = parse_clause(condition)?;
    let actual = resolve_key(clause.key, outcome, context)?;
    Ok(equals(actual, clause.key, clause.value))
}

fn parse_clause(condition: &str) -> Result<Clause<'_>, String> {
    let trimmed = condition.trim();
    let (left, right) = trimmed
        .split_once('=')
        .ok_or_else(|| format!("condition '{}' is missing '='", trimmed))?;
    let key = left.trim();
    let value = right.trim();
    if key.is_empty() {
        return Err("condition clause has empty key".to_string());
    }
    Ok(Clause { key, value })
}

fn is_condition_key(key: &str) -> bool {
    if key == "outcome" || key == "preferred_label" {
        return true;
    }
    if !key.starts_with("context.") {
        return false;
    }
    let suffix = &key["context.".len()..];
    let mut chars = suffix.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

fn resolve_key<'a>(
    key: &str,
    outcome: &'a NodeOutcome,
    context: &'a RuntimeContext,
) -> Result<Option<Value>, String> {
    match key {
        "outcome" => Ok(Some(Value::String(outcome.status.as_str().to_string()))),
        "preferred_label" => Ok(outcome.preferred_label.clone().map(Value::String)),
        _ if key.starts_with("context.") => Ok(context.get(&key["context.".len()..]).cloned()),
        _ => Err(format!("condition key '{}' is invalid", key)),
    }
}

fn equals(actual: Option<Value>, key: &str, expected_raw: &str) -> bool {
    if key == "outcome" {
        let expected = expected_raw.trim();
        return actual
            .as_ref()
            .and_then(Value::as_str)
            .map(|value| value.eq_ignore_ascii_case(expected))
            .unwrap_or(false);
    }
    let expected = parse_literal(expected_raw);
    match (actual, expected) {
        (Some(Value::String(left)), Value::String(right)) => left == right,
        (Some(Value::Bool(left)), Value::Bool(right)) => left == right,
        (Some(Value::Number(left)), Value::Number(right)) => left == right,
        (Some(left), right) => json_to_string(&left) == json_to_string(&right),
        (None, Value::Null) => true,
        (None, _) => false,
    }
}

fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Number(integer.into());
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(trimmed);
    Value::String(unquoted.to_string())
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(inner) => inner.clone(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeStatus;
    use std::collections::BTreeMap;

    fn outcome() -> NodeOutcome {
        NodeOutcome {
            status: NodeStatus::Success,
            notes: None,
            context_updates: BTreeMap::new(),
            preferred_label: Some("Yes".to_string()),
            suggested_next_ids: Vec::new(),
        }
    }

    #[test]
    fn validate_condition_expression_invalid_key_expected_err() {
        let error = validate_condition_expression("foo=bar").expect_err("validation should fail");
        assert!(error.contains("invalid"));
    }

    #[test]
    fn evaluate_condition_expression_outcome_match_expected_true() {
        let ok = evaluate_condition_expression("outcome=Success", &outcome(), &RuntimeContext::new())
            .expect("evaluation should succeed");
        assert!(ok);
    }

    #[test]
    fn evaluate_condition_expression_outcome_mismatch_expected_false() {
        let ok = evaluate_condition_expression("outcome=fail", &outcome(), &RuntimeContext::new())
            .expect("evaluation should succeed");
        assert!(!ok);
    }

    #[test]
    fn evaluate_condition_expression_context_key_expected_true() {
        let mut context = RuntimeContext::new();
        context.insert("ready".to_string(), Value::Bool(true));
        let ok = evaluate_condition_expression("context.ready=true", &outcome(), &context)
            .expect("evaluation should succeed");
        assert!(ok);
    }

    #[test]
    fn evaluate_condition_expression_rejects_conjunction() {
        let error = evaluate_condition_expression(
            "outcome=success && preferred_label=Yes",
            &outcome(),
            &RuntimeContext::new(),
        )
        .expect("parse should still succeed as a single literal comparison");
        assert!(!error);
    }
}

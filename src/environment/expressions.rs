use super::services::Services;
use crate::error::{Error, Result};
use serde_json::{Number, Value};

/// Expression resolver used for loop conditions, cardinality, collections,
/// reference names and timer durations.
pub trait Expressions {
    fn resolve(&self, expression: &str, scope: &Value, services: &Services) -> Result<Value>;
}

/// Resolves `${path.to.value}` against the scope.
///
/// - A string that is exactly one expression resolves to the raw value.
/// - Expressions embedded in text are interpolated into a string.
/// - `length` of arrays and strings is supported, as are array indexes `list[1]`.
/// - `${environment.services.name()}` calls a registered service with the scope.
/// - Unknown paths resolve to `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExpressions;

impl Expressions for DefaultExpressions {
    fn resolve(&self, expression: &str, scope: &Value, services: &Services) -> Result<Value> {
        let trimmed = expression.trim();
        if let Some(inner) = single_expression(trimmed) {
            return evaluate(inner, scope, services);
        }

        if !expression.contains("${") {
            return Ok(Value::String(expression.into()));
        }

        let mut result = String::new();
        let mut rest = expression;
        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| Error::Expression(format!("unclosed expression in >{expression}<")))?;
            match evaluate(&after[..end], scope, services)? {
                Value::Null => {}
                Value::String(text) => result.push_str(&text),
                other => result.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        result.push_str(rest);
        Ok(Value::String(result))
    }
}

fn single_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains("${") && !inner.contains('}')).then_some(inner)
}

fn evaluate(path: &str, scope: &Value, services: &Services) -> Result<Value> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::Expression("empty expression".into()));
    }

    if let Some(call) = path.strip_suffix("()") {
        let name = call
            .strip_prefix("environment.services.")
            .ok_or_else(|| Error::Expression(format!("cannot call >{path}<")))?;
        return services.call(name, scope);
    }

    if let Some(literal) = literal(path) {
        return Ok(literal);
    }

    let normalized = path.replace('[', ".").replace(']', "");
    let segments: Vec<&str> = normalized.split('.').filter(|segment| !segment.is_empty()).collect();
    Ok(lookup(scope, &segments).unwrap_or(Value::Null))
}

fn lookup(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => lookup(map.get(*segment)?, rest),
        Value::Array(list) if *segment == "length" => lookup(&Value::from(list.len()), rest),
        Value::Array(list) => lookup(list.get(segment.parse::<usize>().ok()?)?, rest),
        Value::String(text) if *segment == "length" => {
            lookup(&Value::from(text.chars().count()), rest)
        }
        _ => None,
    }
}

fn literal(path: &str) -> Option<Value> {
    match path {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => {
            if let Ok(integer) = path.parse::<i64>() {
                return Some(Value::Number(integer.into()));
            }
            path.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
    }
}

/// Truthiness of a resolved condition.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

use serde_json::Value;

use strata_core::types::VarMap;

/// Evaluate an edge condition against run variables.
///
/// Supported expressions:
/// - `key == "value"`, `key != "value"`
/// - `key contains "substr"` (strings and arrays)
/// - `key > 3`, `key >= 3`, `key < 3`, `key <= 3`
/// - `key` alone, true when the value is truthy
/// - clauses chained with `&&` and `||` (`&&` binds tighter)
///
/// Operators and separators inside quoted literals are part of the literal.
///
/// Keys may be dot paths into nested objects. Returns `false` for
/// unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, variables: &VarMap) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }
    split_unquoted(expr, "||").into_iter().any(|any| {
        split_unquoted(any, "&&")
            .into_iter()
            .all(|clause| evaluate_clause(clause.trim(), variables))
    })
}

const OPERATORS: &[&str] = &[" contains ", "!=", "==", ">=", "<=", ">", "<"];

fn evaluate_clause(clause: &str, variables: &VarMap) -> bool {
    for op in OPERATORS {
        if let Some((key, literal)) = parse_operator(clause, op) {
            let Some(actual) = lookup(variables, key) else {
                return false;
            };
            let expected = parse_literal(literal);
            return match op.trim() {
                "contains" => contains(actual, &expected),
                "==" => loosely_equal(actual, &expected),
                "!=" => !loosely_equal(actual, &expected),
                cmp => match (as_number(actual), as_number(&expected)) {
                    (Some(a), Some(b)) => match cmp {
                        ">=" => a >= b,
                        "<=" => a <= b,
                        ">" => a > b,
                        _ => a < b,
                    },
                    _ => false,
                },
            };
        }
    }

    // bare key
    if clause.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return lookup(variables, clause).is_some_and(truthy);
    }
    false
}

/// Parse `key OP value`, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let at = find_unquoted(expr, op)?;
    let key = expr[..at].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, expr[at + op.len()..].trim()))
}

/// Byte offset of the first `pat` outside a `"..."` or `'...'` literal.
fn find_unquoted(expr: &str, pat: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if expr[i..].starts_with(pat) => return Some(i),
            None => {}
        }
    }
    None
}

fn split_unquoted<'a>(expr: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut rest = expr;
    while let Some(at) = find_unquoted(rest, sep) {
        parts.push(&rest[..at]);
        rest = &rest[at + sep.len()..];
    }
    parts.push(rest);
    parts
}

fn parse_literal(literal: &str) -> Value {
    let quoted = |q: char| literal.len() >= 2 && literal.starts_with(q) && literal.ends_with(q);
    if quoted('"') || quoted('\'') {
        return Value::String(literal[1..literal.len() - 1].to_string());
    }
    serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string()))
}

fn lookup<'a>(variables: &'a VarMap, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match part.parse::<usize>() {
            Ok(idx) if current.is_array() => current.get(idx)?,
            _ => current.get(part)?,
        };
    }
    Some(current)
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), b) | (b, Value::String(a)) if !b.is_string() => {
            match (a.trim().parse::<f64>().ok(), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => b.as_bool().map(|flag| a == &flag.to_string()).unwrap_or(false),
            }
        }
        (Value::Number(_), Value::Number(_)) => as_number(actual) == as_number(expected),
        _ => false,
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

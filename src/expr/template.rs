//! `${...}` interpolation over strings, maps and JSON documents

use std::collections::BTreeMap;

use serde_json::Value;

use super::eval::{display, evaluate, truthy, Scope};
use super::parser::{parse, Expr};
use super::ExpressionError;

/// A scope layering named bindings (`res`, `head`, `msg`) over a base scope
pub struct Bindings<'a> {
    base: &'a dyn Scope,
    locals: Vec<(&'static str, &'a Value)>,
}

impl<'a> Bindings<'a> {
    pub fn new(base: &'a dyn Scope) -> Self {
        Self {
            base,
            locals: Vec::new(),
        }
    }

    /// Bind `name` to `value`, shadowing any cache entry of the same name
    pub fn with(mut self, name: &'static str, value: &'a Value) -> Self {
        self.locals.push((name, value));
        self
    }
}

impl Scope for Bindings<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .rev()
            .find(|(bound, _)| *bound == name)
            .map(|(_, value)| *value)
            .or_else(|| self.base.lookup(name))
    }
}

/// A piece of a template string
#[derive(Debug, PartialEq)]
enum Segment<'s> {
    Text(&'s str),
    Expr(&'s str),
}

/// Split a template into literal text and `${...}` expression sources
fn segments(template: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut out = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + 2..];
        let end = closing_brace(body).ok_or_else(|| {
            ExpressionError::Syntax(format!("Unterminated '${{' in '{}'", template))
        })?;
        out.push(Segment::Expr(&body[..end]));
        rest = &body[end + 1..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// Byte offset of the `}` closing an expression body, skipping nested
/// braces and quoted strings
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn eval_source(source: &str, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    let expr = parse(source).map_err(|e| e.within(source))?;
    evaluate(&expr, scope).map_err(|e| e.within(source))
}

/// Whether a string contains any `${...}` expression
pub fn has_expressions(template: &str) -> bool {
    template.contains("${")
}

/// Resolve a template string to a value
///
/// A template that is exactly one expression yields the expression's raw
/// value; anything else yields a string with each expression rendered in
/// place. Strings without expressions come back unchanged.
pub fn resolve_str(template: &str, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    if !has_expressions(template) {
        return Ok(Value::String(template.to_string()));
    }

    let parts = segments(template)?;
    if let [Segment::Expr(source)] = parts.as_slice() {
        return eval_source(source, scope);
    }

    let mut out = String::with_capacity(template.len());
    for part in parts {
        match part {
            Segment::Text(text) => out.push_str(text),
            Segment::Expr(source) => out.push_str(&display(&eval_source(source, scope)?)),
        }
    }
    Ok(Value::String(out))
}

/// Resolve a template string and render the result as text
pub fn resolve_string(template: &str, scope: &dyn Scope) -> Result<String, ExpressionError> {
    resolve_str(template, scope).map(|v| display(&v))
}

/// Resolve every value of a string map
pub fn resolve_map(
    map: &BTreeMap<String, String>,
    scope: &dyn Scope,
) -> Result<BTreeMap<String, String>, ExpressionError> {
    map.iter()
        .map(|(key, template)| Ok((key.clone(), resolve_string(template, scope)?)))
        .collect::<Result<BTreeMap<_, _>, ExpressionError>>()
}

/// Resolve every string leaf of a JSON document
pub fn resolve_value(value: &Value, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    match value {
        Value::String(template) => resolve_str(template, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_value(item, scope)?)))
            .collect::<Result<serde_json::Map<_, _>, ExpressionError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Strip an optional `${...}` wrapper from a bare expression
fn bare(source: &str) -> &str {
    let trimmed = source.trim();
    match trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(inner) if closing_brace(inner).is_none() => inner,
        _ => trimmed,
    }
}

/// Parse a bare expression (predicate, filter or variable source)
pub fn compile(source: &str) -> Result<Expr, ExpressionError> {
    let source = bare(source);
    parse(source).map_err(|e| e.within(source))
}

/// Evaluate a bare expression to a value
pub fn eval_expression(source: &str, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    let expr = compile(source)?;
    evaluate(&expr, scope).map_err(|e| e.within(bare(source)))
}

/// Evaluate a bare expression and apply JS truthiness
pub fn eval_predicate(source: &str, scope: &dyn Scope) -> Result<bool, ExpressionError> {
    eval_expression(source, scope).map(|v| truthy(&v))
}

/// Root name of a bare expression, e.g. `res` for `res.items[0]`
pub fn root_name(source: &str) -> Option<String> {
    let source = bare(source);
    let end = source
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(source.len());
    (end > 0).then(|| source[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapScope(HashMap<String, Value>);

    impl Scope for MapScope {
        fn lookup(&self, name: &str) -> Option<&Value> {
            self.0.get(name)
        }
    }

    fn cache() -> MapScope {
        MapScope(
            [
                ("token".to_string(), json!("abc")),
                ("userId".to_string(), json!(42)),
                ("user".to_string(), json!({"name": "ada", "tags": ["x"]})),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_plain_string_is_unchanged() {
        let scope = cache();
        assert_eq!(
            resolve_str("https://svc/users", &scope).unwrap(),
            json!("https://svc/users")
        );
    }

    #[test]
    fn test_single_expression_keeps_type() {
        let scope = cache();
        assert_eq!(resolve_str("${userId}", &scope).unwrap(), json!(42));
        assert_eq!(
            resolve_str("${user}", &scope).unwrap(),
            json!({"name": "ada", "tags": ["x"]})
        );
    }

    #[test]
    fn test_mixed_text_interpolates() {
        let scope = cache();
        assert_eq!(
            resolve_string("Bearer ${token}", &scope).unwrap(),
            "Bearer abc"
        );
        assert_eq!(
            resolve_string("/users/${userId}/tags/${user.tags[0]}", &scope).unwrap(),
            "/users/42/tags/x"
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let scope = cache();
        let once = resolve_value(&json!({"id": "${userId}", "n": "${user.name}"}), &scope)
            .unwrap();
        let twice = resolve_value(&once, &scope).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, json!({"id": 42, "n": "ada"}));
    }

    #[test]
    fn test_braces_inside_strings() {
        let scope = cache();
        assert_eq!(resolve_string("${'{' + token + '}'}", &scope).unwrap(), "{abc}");
    }

    #[test]
    fn test_errors_propagate() {
        let scope = cache();
        assert!(resolve_str("${missing}", &scope).is_err());
        assert!(resolve_str("${token", &scope).is_err());
        assert!(resolve_str("${token ===}", &scope).is_err());
    }

    #[test]
    fn test_bindings_shadow_cache() {
        let base = cache();
        let res = json!({"code": 200});
        let scope = Bindings::new(&base).with("res", &res);
        assert!(eval_predicate("res.code === 200 && token === 'abc'", &scope).unwrap());
        assert!(eval_predicate("${res.code === 200}", &scope).unwrap());
    }

    #[test]
    fn test_root_name() {
        assert_eq!(root_name("res.items[0]").as_deref(), Some("res"));
        assert_eq!(root_name(" head['x']").as_deref(), Some("head"));
        assert_eq!(root_name("'lit'"), None);
    }
}

//! Tree-walking evaluator over JSON values
//!
//! Values are `serde_json::Value`; member chains are evaluated by reference
//! so predicates over large response bodies never clone the body itself.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::Value;

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExpressionError;

static NULL: Value = Value::Null;

/// Name lookup for evaluation
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

/// Evaluate an expression to an owned value
pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    eval(expr, scope).map(Cow::into_owned)
}

/// JS truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build a JSON number, preferring integers; non-finite results become null
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// String rendering used for interpolation and concatenation
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval<'a>(expr: &'a Expr, scope: &'a dyn Scope) -> Result<Cow<'a, Value>, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(Cow::Borrowed(value)),
        Expr::Name(name) => scope
            .lookup(name)
            .map(Cow::Borrowed)
            .ok_or_else(|| ExpressionError::UnknownName(name.clone())),
        Expr::Array(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Cow::Owned(Value::Array(values)))
        }
        Expr::Member(target, property) => {
            let target = eval(target, scope)?;
            member(target, property)
        }
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = evaluate(index, scope)?;
            match &index {
                Value::String(key) => member(target, key),
                Value::Number(n) => {
                    let label = n.to_string();
                    match (target, n.as_u64()) {
                        (Cow::Borrowed(Value::Array(items)), Some(i)) => Ok(items
                            .get(i as usize)
                            .map(Cow::Borrowed)
                            .unwrap_or(Cow::Owned(Value::Null))),
                        (Cow::Owned(Value::Array(mut items)), Some(i)) => {
                            let i = i as usize;
                            Ok(Cow::Owned(if i < items.len() {
                                items.swap_remove(i)
                            } else {
                                Value::Null
                            }))
                        }
                        (target, _) => member(target, &label),
                    }
                }
                other => Err(ExpressionError::Type(format!(
                    "Cannot index with {}",
                    other
                ))),
            }
        }
        Expr::Call {
            receiver,
            method,
            args,
        } => {
            let receiver = eval(receiver, scope)?;
            let args = args
                .iter()
                .map(|arg| evaluate(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(&receiver, method, &args).map(Cow::Owned)
        }
        Expr::Unary(op, inner) => {
            let value = eval(inner, scope)?;
            Ok(Cow::Owned(match op {
                UnaryOp::Not => Value::Bool(!truthy(&value)),
                UnaryOp::Neg => number(-to_number(&value)),
            }))
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let left = eval(lhs, scope)?;
            if truthy(&left) {
                eval(rhs, scope)
            } else {
                Ok(left)
            }
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let left = eval(lhs, scope)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(rhs, scope)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, scope)?;
            let right = eval(rhs, scope)?;
            Ok(Cow::Owned(binary(*op, &left, &right)))
        }
        Expr::Conditional(cond, then, otherwise) => {
            if truthy(&*eval(cond, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

fn member<'a>(target: Cow<'a, Value>, property: &str) -> Result<Cow<'a, Value>, ExpressionError> {
    if property == "length" {
        match &*target {
            Value::String(s) => return Ok(Cow::Owned(Value::from(s.chars().count()))),
            Value::Array(items) => return Ok(Cow::Owned(Value::from(items.len()))),
            _ => {}
        }
    }

    match target {
        Cow::Borrowed(Value::Null) | Cow::Owned(Value::Null) => {
            Err(ExpressionError::NullAccess(property.to_string()))
        }
        Cow::Borrowed(Value::Object(map)) => Ok(map
            .get(property)
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Null))),
        Cow::Owned(Value::Object(mut map)) => {
            Ok(Cow::Owned(map.remove(property).unwrap_or(Value::Null)))
        }
        Cow::Borrowed(Value::Array(items)) => Ok(property
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Null))),
        _ => Ok(Cow::Owned(Value::Null)),
    }
}

fn call(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    let arg = |i: usize| args.get(i).unwrap_or(&NULL);

    match (receiver, method) {
        (Value::Null, _) => Err(ExpressionError::NullAccess(method.to_string())),
        (Value::String(s), "includes") => Ok(Value::Bool(s.contains(&display(arg(0))))),
        (Value::Array(items), "includes") => Ok(Value::Bool(
            items.iter().any(|item| strict_equals(item, arg(0))),
        )),
        (Value::String(s), "startsWith") => Ok(Value::Bool(s.starts_with(&display(arg(0))))),
        (Value::String(s), "endsWith") => Ok(Value::Bool(s.ends_with(&display(arg(0))))),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (value, "toString") => Ok(Value::String(display(value))),
        (value, method) => Err(ExpressionError::UnknownMethod(format!(
            "{} on {}",
            method,
            type_name(value)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Eq => Value::Bool(loose_equals(left, right)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(left, right)),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::LtEq => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::GtEq => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                Value::String(format!("{}{}", display(left), display(right)))
            } else {
                number(to_number(left) + to_number(right))
            }
        }
        BinaryOp::Sub => number(to_number(left) - to_number(right)),
        BinaryOp::Mul => number(to_number(left) * to_number(right)),
        BinaryOp::Div => number(to_number(left) / to_number(right)),
        BinaryOp::Rem => number(to_number(left) % to_number(right)),
        // Short-circuit operators never reach here
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), Value::Number(_))
        | (Value::Number(_), Value::Bool(_)) => to_number(left) == to_number(right),
        _ => strict_equals(left, right),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => to_number(left).partial_cmp(&to_number(right)),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

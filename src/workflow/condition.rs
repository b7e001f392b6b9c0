//! Restricted condition expressions for rules.
//!
//! A condition is a small tagged tree of comparisons and boolean
//! combinators evaluated against the JSON view of an event:
//! `{id, type, timestamp, source, payload}`. Paths are dot separated
//! (`payload.container.id`, `source.component`); numeric segments index
//! into arrays. A missing path reads as `null`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::broker::{Message, Pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Substring, array element or object key.
    Contains,
    /// Wildcard match with `*` and `?`; `value` is the pattern.
    Matches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Exists {
        path: String,
    },
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    And {
        all: Vec<Condition>,
    },
    Or {
        any: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    pub fn exists(path: impl Into<String>) -> Self {
        Condition::Exists { path: path.into() }
    }

    pub fn compare(path: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::And { all: conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Or { any: conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// An empty `And` holds, an empty `Or` does not.
    pub fn evaluate(&self, view: &Value) -> bool {
        match self {
            Condition::Always => true,
            Condition::Exists { path } => !lookup(view, path).is_null(),
            Condition::Compare { path, op, value } => compare(lookup(view, path), *op, value),
            Condition::And { all } => all.iter().all(|c| c.evaluate(view)),
            Condition::Or { any } => any.iter().any(|c| c.evaluate(view)),
            Condition::Not { condition } => !condition.evaluate(view),
        }
    }
}

/// The view conditions, predicates and rule callbacks see.
pub fn event_view(message: &Message) -> Value {
    json!({
        "id": message.id,
        "type": message.message_type,
        "timestamp": message.timestamp,
        "source": serde_json::to_value(&message.source).unwrap_or(Value::Null),
        "payload": message.payload,
    })
}

static NULL: Value = Value::Null;

fn lookup<'a>(view: &'a Value, path: &str) -> &'a Value {
    let mut current = view;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return &NULL,
        }
    }
    current
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, expected),
        CompareOp::Ne => !loosely_equal(actual, expected),
        CompareOp::Gt => order(actual, expected) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => order(actual, expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(
            order(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        CompareOp::Matches => match (actual, expected) {
            (Value::String(text), Value::String(pattern)) => Pattern::compile(pattern)
                .map(|p| p.matches(text))
                .unwrap_or(false),
            _ => false,
        },
    }
}

/// Numbers compare by value so `1` equals `1.0`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> Value {
        json!({
            "id": "m-1",
            "type": "container.discovered",
            "timestamp": 1_700_000_000_000i64,
            "source": { "component": "discovery" },
            "payload": {
                "count": 3,
                "name": "product-list",
                "tags": ["grid", "lazy"],
                "items": [{ "selector": ".card" }]
            }
        })
    }

    #[test]
    fn test_paths_and_missing_values() {
        let view = view();
        assert!(Condition::exists("payload.items.0.selector").evaluate(&view));
        assert!(!Condition::exists("payload.items.3").evaluate(&view));
        assert!(!Condition::exists("payload.name.first").evaluate(&view));
        assert!(Condition::equals("payload.missing", Value::Null).evaluate(&view));
    }

    #[test]
    fn test_comparisons() {
        let view = view();
        assert!(Condition::equals("payload.count", 3.0).evaluate(&view));
        assert!(Condition::compare("payload.count", CompareOp::Gt, 2).evaluate(&view));
        assert!(Condition::compare("payload.count", CompareOp::Le, 3).evaluate(&view));
        assert!(!Condition::compare("payload.name", CompareOp::Gt, 5).evaluate(&view));
        assert!(Condition::compare("payload.name", CompareOp::Contains, "list").evaluate(&view));
        assert!(Condition::compare("payload.tags", CompareOp::Contains, "lazy").evaluate(&view));
        assert!(Condition::compare("type", CompareOp::Matches, "container.*").evaluate(&view));
        assert!(!Condition::compare("type", CompareOp::Matches, "").evaluate(&view));
    }

    #[test]
    fn test_combinators() {
        let view = view();
        let discovered = Condition::equals("source.component", "discovery");
        let big = Condition::compare("payload.count", CompareOp::Ge, 10);

        assert!(!Condition::all(vec![discovered.clone(), big.clone()]).evaluate(&view));
        assert!(Condition::any(vec![discovered.clone(), big.clone()]).evaluate(&view));
        assert!(Condition::negate(big).evaluate(&view));
        assert!(Condition::all(vec![]).evaluate(&view));
        assert!(!Condition::any(vec![]).evaluate(&view));
    }

    #[test]
    fn test_deserializes_from_tagged_json() {
        let condition: Condition = serde_json::from_value(json!({
            "kind": "and",
            "all": [
                { "kind": "exists", "path": "payload.name" },
                { "kind": "compare", "path": "payload.count", "op": "lt", "value": 5 }
            ]
        }))
        .unwrap();
        assert!(condition.evaluate(&view()));
    }
}

//! Mongo-style selectors over JSON documents.
//!
//! Supports implicit equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
//! `$in`, `$nin`, `$exists`, `$and`, `$or` and dotted field paths. Array
//! fields match equality and membership when any element matches.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SelectorError {
    #[error("selector must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("unsupported selector operator '{0}'")]
    UnknownOperator(String),
    #[error("operator '{op}' expects {expected}")]
    BadOperand { op: String, expected: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    /// Several operators on the same field, e.g. `{"$gte": 1, "$lt": 5}`.
    All(Vec<Condition>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Matches every document (the empty selector `{}`).
    All,
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Field { path: String, condition: Condition },
}

impl Selector {
    /// Parse a selector from its JSON form.
    pub fn parse(value: &Value) -> Result<Self, SelectorError> {
        let Value::Object(map) = value else {
            return Err(SelectorError::NotAnObject(value.to_string()));
        };
        parse_object(map)
    }

    /// Parse an optional filter; `None` matches everything.
    pub fn from_filter(filter: Option<&Value>) -> Result<Self, SelectorError> {
        match filter {
            Some(value) => Self::parse(value),
            None => Ok(Self::All),
        }
    }

    /// `{"id": {"$in": ids}}`
    pub fn id_in<S: AsRef<str>>(ids: &[S]) -> Self {
        Self::Field {
            path: "id".into(),
            condition: Condition::In(
                ids.iter()
                    .map(|id| Value::String(id.as_ref().to_string()))
                    .collect(),
            ),
        }
    }

    /// Ids this selector is restricted to, when it pins `id` by equality or
    /// membership. Lets stores narrow a scan through their id index.
    pub fn id_candidates(&self) -> Option<Vec<String>> {
        match self {
            Self::Field { path, condition } if path == "id" => match condition {
                Condition::Eq(Value::String(id)) => Some(vec![id.clone()]),
                Condition::In(values) => values
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => None,
            },
            Self::And(parts) => parts.iter().find_map(Selector::id_candidates),
            _ => None,
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::All => true,
            Self::And(parts) => parts.iter().all(|s| s.matches(document)),
            Self::Or(parts) => parts.iter().any(|s| s.matches(document)),
            Self::Field { path, condition } => condition.holds(lookup(document, path)),
        }
    }

    /// Convenience for matching a metadata map directly.
    pub fn matches_map(&self, map: &Map<String, Value>) -> bool {
        match self {
            Self::All => true,
            _ => self.matches(&Value::Object(map.clone())),
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Selector, SelectorError> {
    let mut parts = Vec::with_capacity(map.len());

    for (key, value) in map {
        let part = match key.as_str() {
            "$and" => Selector::And(parse_list("$and", value)?),
            "$or" => Selector::Or(parse_list("$or", value)?),
            op if op.starts_with('$') => return Err(SelectorError::UnknownOperator(op.into())),
            field => Selector::Field {
                path: field.to_string(),
                condition: parse_condition(value)?,
            },
        };
        parts.push(part);
    }

    Ok(match parts.len() {
        0 => Selector::All,
        1 => parts.remove(0),
        _ => Selector::And(parts),
    })
}

fn parse_list(op: &str, value: &Value) -> Result<Vec<Selector>, SelectorError> {
    let Value::Array(items) = value else {
        return Err(SelectorError::BadOperand {
            op: op.into(),
            expected: "an array of selectors",
        });
    };
    items.iter().map(Selector::parse).collect()
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn parse_condition(value: &Value) -> Result<Condition, SelectorError> {
    let ops = match value {
        Value::Object(map) if is_operator_object(map) => map,
        other => return Ok(Condition::Eq(other.clone())),
    };

    let mut conditions = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$in" | "$nin" => {
                let Value::Array(values) = operand else {
                    return Err(SelectorError::BadOperand {
                        op: op.clone(),
                        expected: "an array",
                    });
                };
                if op == "$in" {
                    Condition::In(values.clone())
                } else {
                    Condition::Nin(values.clone())
                }
            }
            "$exists" => {
                let Value::Bool(flag) = operand else {
                    return Err(SelectorError::BadOperand {
                        op: op.clone(),
                        expected: "a boolean",
                    });
                };
                Condition::Exists(*flag)
            }
            other => return Err(SelectorError::UnknownOperator(other.into())),
        };
        conditions.push(condition);
    }

    Ok(if conditions.len() == 1 {
        conditions.remove(0)
    } else {
        Condition::All(conditions)
    })
}

/// Resolve a dotted path such as `metadata.method`.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

impl Condition {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Eq(expected) => equals(value, expected),
            Self::Ne(expected) => !equals(value, expected),
            Self::Gt(bound) => compares(value, bound, |o| o == Ordering::Greater),
            Self::Gte(bound) => compares(value, bound, |o| o != Ordering::Less),
            Self::Lt(bound) => compares(value, bound, |o| o == Ordering::Less),
            Self::Lte(bound) => compares(value, bound, |o| o != Ordering::Greater),
            Self::In(candidates) => candidates.iter().any(|c| equals(value, c)),
            Self::Nin(candidates) => !candidates.iter().any(|c| equals(value, c)),
            Self::Exists(flag) => value.is_some() == *flag,
            Self::All(conditions) => conditions.iter().all(|c| c.holds(value)),
        }
    }
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) if scalar_eq(actual, expected) => true,
        Some(Value::Array(items)) => items.iter().any(|item| scalar_eq(item, expected)),
        Some(_) => false,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compares(value: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| order(item, bound).is_some_and(&accept)),
        Some(actual) => order(actual, bound).is_some_and(accept),
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

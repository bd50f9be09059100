//! Filter predicates and sort orders.

use crate::{error::Result, Error, Model, ModelDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator of a field condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    BeginsWith,
    /// Inclusive range; the operand is a two-element array.
    Between,
}

/// A composable filter over model fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Predicate {
    /// Matches every record.
    All,
    Field {
        field: String,
        operator: Operator,
        operand: Value,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

/// Builder for a single field condition.
pub struct FieldCondition {
    field: String,
}

macro_rules! condition {
    ($name:ident, $op:expr) => {
        pub fn $name(self, operand: impl Into<Value>) -> Predicate {
            Predicate::Field {
                field: self.field,
                operator: $op,
                operand: operand.into(),
            }
        }
    };
}

impl FieldCondition {
    condition!(eq, Operator::Eq);
    condition!(ne, Operator::Ne);
    condition!(gt, Operator::Gt);
    condition!(ge, Operator::Ge);
    condition!(lt, Operator::Lt);
    condition!(le, Operator::Le);
    condition!(contains, Operator::Contains);
    condition!(not_contains, Operator::NotContains);
    condition!(begins_with, Operator::BeginsWith);

    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
        Predicate::Field {
            field: self.field,
            operator: Operator::Between,
            operand: Value::Array(vec![low.into(), high.into()]),
        }
    }
}

impl Predicate {
    /// Start a condition on `field`.
    pub fn field(field: impl Into<String>) -> FieldCondition {
        FieldCondition {
            field: field.into(),
        }
    }

    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And {
            predicates: predicates.into_iter().collect(),
        }
    }

    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or {
            predicates: predicates.into_iter().collect(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Predicate::All)
    }

    /// Whether `id` is the only thing this predicate tests, as `id eq X`.
    pub fn as_id_lookup(&self) -> Option<&str> {
        match self {
            Predicate::Field {
                field,
                operator: Operator::Eq,
                operand: Value::String(id),
            } if field == "id" => Some(id),
            _ => None,
        }
    }

    /// Evaluate against a model.
    pub fn matches(&self, model: &Model) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Field {
                field,
                operator,
                operand,
            } => {
                let id;
                let value = if field == "id" {
                    id = Value::String(model.id().to_string());
                    Some(&id)
                } else {
                    model.get(field)
                };
                evaluate(*operator, value.unwrap_or(&Value::Null), operand)
            }
            Predicate::And { predicates } => predicates.iter().all(|p| p.matches(model)),
            Predicate::Or { predicates } => predicates.iter().any(|p| p.matches(model)),
            Predicate::Not { predicate } => !predicate.matches(model),
        }
    }

    /// Check every referenced field exists on the model and groups are non-empty.
    pub fn validate(&self, definition: &ModelDefinition) -> Result<()> {
        match self {
            Predicate::All => Ok(()),
            Predicate::Field { field, .. } => {
                if field == "id" || definition.field(field).is_some() {
                    Ok(())
                } else {
                    Err(Error::InvalidCriteria)
                }
            }
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                if predicates.is_empty() {
                    return Err(Error::InvalidCriteria);
                }
                predicates.iter().try_for_each(|p| p.validate(definition))
            }
            Predicate::Not { predicate } => predicate.validate(definition),
        }
    }
}

fn evaluate(operator: Operator, value: &Value, operand: &Value) -> bool {
    match operator {
        Operator::Eq => value == operand || numbers_equal(value, operand),
        Operator::Ne => !(value == operand || numbers_equal(value, operand)),
        Operator::Gt => compare(value, operand) == Some(Ordering::Greater),
        Operator::Ge => matches!(compare(value, operand), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => compare(value, operand) == Some(Ordering::Less),
        Operator::Le => matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal)),
        Operator::Contains => contains(value, operand),
        Operator::NotContains => !contains(value, operand),
        Operator::BeginsWith => match (value, operand) {
            (Value::String(v), Value::String(prefix)) => v.starts_with(prefix.as_str()),
            _ => false,
        },
        Operator::Between => match operand.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches!(compare(value, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(value, high), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn contains(value: &Value, operand: &Value) -> bool {
    match (value, operand) {
        (Value::String(v), Value::String(needle)) => v.contains(needle.as_str()),
        (Value::Array(items), needle) => items.contains(needle),
        _ => false,
    }
}

/// Order two values of the same kind. Mixed kinds are incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Multi-field sort, applied in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub fields: Vec<(String, SortDirection)>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortDirection::Ascending));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortDirection::Descending));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compare two models. Missing values sort before present ones.
    pub fn compare(&self, a: &Model, b: &Model) -> Ordering {
        for (field, direction) in &self.fields {
            let ordering = match (sort_key(a, field), sort_key(b, field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare(&x, &y).unwrap_or(Ordering::Equal),
            };
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Sort models in place. The sort is stable.
    pub fn apply(&self, models: &mut [Model]) {
        models.sort_by(|a, b| self.compare(a, b));
    }
}

fn sort_key(model: &Model, field: &str) -> Option<Value> {
    if field == "id" {
        return Some(Value::String(model.id().to_string()));
    }
    model.get(field).filter(|v| !v.is_null()).cloned()
}

//! JSON selector condition tree
//!
//! Conditions arrive as untyped JSON and are parsed into [`Condition`] on
//! evaluation. Parsing validates condition kinds, operators, date values and
//! nesting depth; serializing a parsed condition yields its canonical form.

use crate::error::{Result, SelectorError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Deepest comparison nesting accepted below the root condition
pub const MAX_DEPTH: usize = 2;

/// Entity attributes addressable by a string-field condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringField {
    Id,
    Name,
    Version,
    System,
    Identifier,
    Kind,
}

impl StringField {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "id" => Self::Id,
            "name" => Self::Name,
            "version" => Self::Version,
            "system" => Self::System,
            "identifier" => Self::Identifier,
            "kind" => Self::Kind,
            _ => return None,
        })
    }

    /// Wire name of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::Version => "version",
            Self::System => "system",
            Self::Identifier => "identifier",
            Self::Kind => "kind",
        }
    }

    /// Entity document keys consulted, in order, for this field
    pub(crate) fn document_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Name => &["name"],
            Self::Version => &["version", "tag"],
            Self::System => &["systemId", "systemIds"],
            Self::Identifier => &["identifier"],
            Self::Kind => &["kind"],
        }
    }
}

/// Operators shared by string-field and metadata conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

impl StringOperator {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "equals" => Self::Equals,
            "starts-with" => Self::StartsWith,
            "ends-with" => Self::EndsWith,
            "contains" => Self::Contains,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::StartsWith => "starts-with",
            Self::EndsWith => "ends-with",
            Self::Contains => "contains",
        }
    }

    /// Apply the operator to a candidate value
    pub fn apply(&self, candidate: &str, value: &str) -> bool {
        match self {
            Self::Equals => candidate == value,
            Self::StartsWith => candidate.starts_with(value),
            Self::EndsWith => candidate.ends_with(value),
            Self::Contains => candidate.contains(value),
        }
    }
}

/// Timestamp attributes addressable by a date condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateField {
    CreatedAt,
    UpdatedAt,
}

impl DateField {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created-at" => Some(Self::CreatedAt),
            "updated-at" => Some(Self::UpdatedAt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created-at",
            Self::UpdatedAt => "updated-at",
        }
    }

    pub(crate) fn document_key(&self) -> &'static str {
        match self {
            Self::CreatedAt => "createdAt",
            Self::UpdatedAt => "updatedAt",
        }
    }
}

/// Date comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateOperator {
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

impl DateOperator {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "before" => Self::Before,
            "after" => Self::After,
            "before-or-on" => Self::BeforeOrOn,
            "after-or-on" => Self::AfterOrOn,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::BeforeOrOn => "before-or-on",
            Self::AfterOrOn => "after-or-on",
        }
    }

    /// Compare two instants already truncated to whole seconds
    pub fn apply(&self, measured: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
        match self {
            Self::Before => measured < reference,
            Self::After => measured > reference,
            Self::BeforeOrOn => measured <= reference,
            Self::AfterOrOn => measured >= reference,
        }
    }
}

/// Boolean combinators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    And,
    Or,
}

impl ComparisonOperator {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// Parsed selector condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    StringField {
        field: StringField,
        operator: StringOperator,
        value: String,
    },
    Metadata {
        key: String,
        operator: StringOperator,
        value: String,
    },
    Date {
        field: DateField,
        operator: DateOperator,
        value: DateTime<Utc>,
    },
    Comparison {
        operator: ComparisonOperator,
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// Parse a condition tree from JSON
    pub fn parse(value: &Value) -> Result<Self> {
        Self::parse_at(value, 0)
    }

    /// Condition that admits every entity (an empty `and`)
    pub fn match_all() -> Self {
        Self::Comparison {
            operator: ComparisonOperator::And,
            conditions: Vec::new(),
        }
    }

    fn parse_at(value: &Value, depth: usize) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            SelectorError::InvalidCondition(format!(
                "condition must be an object, found {}",
                json_type_name(value)
            ))
        })?;

        let kind = required_str(object, "type")?;
        let operator = required_str(object, "operator")?;

        if let Some(field) = StringField::parse(kind) {
            return Ok(Self::StringField {
                field,
                operator: parse_operator(kind, operator, StringOperator::parse)?,
                value: required_str(object, "value")?.to_string(),
            });
        }

        if let Some(field) = DateField::parse(kind) {
            let raw = required_str(object, "value")?;
            return Ok(Self::Date {
                field,
                operator: parse_operator(kind, operator, DateOperator::parse)?,
                value: parse_date(raw)?,
            });
        }

        match kind {
            "metadata" => Ok(Self::Metadata {
                key: required_str(object, "key")?.to_string(),
                operator: parse_operator(kind, operator, StringOperator::parse)?,
                value: required_str(object, "value")?.to_string(),
            }),
            "comparison" => {
                if depth > MAX_DEPTH {
                    return Err(SelectorError::DepthExceeded {
                        depth,
                        max: MAX_DEPTH,
                    });
                }
                let operator = parse_operator(kind, operator, ComparisonOperator::parse)?;
                let children = object
                    .get("conditions")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SelectorError::InvalidCondition(
                            "comparison requires a 'conditions' array".into(),
                        )
                    })?;
                let conditions = children
                    .iter()
                    .map(|child| Self::parse_at(child, depth + 1))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Comparison {
                    operator,
                    conditions,
                })
            }
            other => Err(SelectorError::UnknownCondition(other.to_string())),
        }
    }

    /// Canonical JSON form of this condition
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        match self {
            Self::StringField {
                field,
                operator,
                value,
            } => {
                object.insert("type".into(), field.as_str().into());
                object.insert("operator".into(), operator.as_str().into());
                object.insert("value".into(), value.clone().into());
            }
            Self::Metadata {
                key,
                operator,
                value,
            } => {
                object.insert("type".into(), "metadata".into());
                object.insert("key".into(), key.clone().into());
                object.insert("operator".into(), operator.as_str().into());
                object.insert("value".into(), value.clone().into());
            }
            Self::Date {
                field,
                operator,
                value,
            } => {
                object.insert("type".into(), field.as_str().into());
                object.insert("operator".into(), operator.as_str().into());
                object.insert(
                    "value".into(),
                    value.to_rfc3339_opts(SecondsFormat::AutoSi, true).into(),
                );
            }
            Self::Comparison {
                operator,
                conditions,
            } => {
                object.insert("type".into(), "comparison".into());
                object.insert("operator".into(), operator.as_str().into());
                object.insert(
                    "conditions".into(),
                    Value::Array(conditions.iter().map(Self::to_value).collect()),
                );
            }
        }
        Value::Object(object)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn required_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(SelectorError::InvalidCondition(format!(
            "'{}' must be a string, found {}",
            key,
            json_type_name(other)
        ))),
        None => Err(SelectorError::InvalidCondition(format!(
            "missing required property '{}'",
            key
        ))),
    }
}

fn parse_operator<T>(kind: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(raw).ok_or_else(|| SelectorError::UnknownOperator {
        condition: kind.to_string(),
        operator: raw.to_string(),
    })
}

pub(crate) fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SelectorError::MalformedDate {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

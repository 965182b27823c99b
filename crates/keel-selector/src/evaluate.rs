//! Condition evaluation against entity documents
//!
//! Entities are projected into their camelCase JSON document and conditions
//! read attributes from it. Missing attributes and missing metadata keys are
//! non-matches; attributes of the wrong JSON type are errors.

use crate::condition::{json_type_name, parse_date, ComparisonOperator, Condition};
use crate::error::{Result, SelectorError};
use chrono::{DateTime, Utc};
use serde_json::Value;

impl Condition {
    /// Evaluate this condition against an entity document
    pub fn evaluate(&self, document: &Value) -> Result<bool> {
        match self {
            Condition::StringField {
                field,
                operator,
                value,
            } => {
                for key in field.document_keys() {
                    match document.get(*key) {
                        None | Some(Value::Null) => continue,
                        Some(Value::String(candidate)) => {
                            return Ok(operator.apply(candidate, value));
                        }
                        Some(Value::Array(items)) => {
                            for item in items {
                                let candidate = item.as_str().ok_or_else(|| {
                                    SelectorError::TypeMismatch {
                                        field: (*key).to_string(),
                                        expected: "string",
                                        found: json_type_name(item),
                                    }
                                })?;
                                if operator.apply(candidate, value) {
                                    return Ok(true);
                                }
                            }
                            return Ok(false);
                        }
                        Some(other) => {
                            return Err(SelectorError::TypeMismatch {
                                field: (*key).to_string(),
                                expected: "string",
                                found: json_type_name(other),
                            });
                        }
                    }
                }
                Ok(false)
            }
            Condition::Metadata {
                key,
                operator,
                value,
            } => {
                let metadata = match document.get("metadata") {
                    None | Some(Value::Null) => return Ok(false),
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        return Err(SelectorError::MalformedMetadata(format!(
                            "expected object, found {}",
                            json_type_name(other)
                        )));
                    }
                };
                match metadata.get(key) {
                    None => Ok(false),
                    Some(Value::String(candidate)) => Ok(operator.apply(candidate, value)),
                    Some(other) => Err(SelectorError::MalformedMetadata(format!(
                        "value for key '{}' must be a string, found {}",
                        key,
                        json_type_name(other)
                    ))),
                }
            }
            Condition::Date {
                field,
                operator,
                value,
            } => {
                let key = field.document_key();
                let measured = match document.get(key) {
                    None | Some(Value::Null) => return Ok(false),
                    Some(Value::String(raw)) => parse_date(raw)?,
                    Some(other) => {
                        return Err(SelectorError::TypeMismatch {
                            field: key.to_string(),
                            expected: "RFC3339 string",
                            found: json_type_name(other),
                        });
                    }
                };
                Ok(operator.apply(truncate_to_seconds(measured), truncate_to_seconds(*value)))
            }
            Condition::Comparison {
                operator,
                conditions,
            } => match operator {
                ComparisonOperator::And => {
                    for condition in conditions {
                        if !condition.evaluate(document)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                ComparisonOperator::Or => {
                    for condition in conditions {
                        if condition.evaluate(document)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
        }
    }
}

/// Drop sub-second precision
pub fn truncate_to_seconds(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(instant.timestamp(), 0).unwrap_or(instant)
}

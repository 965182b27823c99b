//! Selector wire type and the pluggable evaluator

use crate::condition::Condition;
use crate::error::{Result, SelectorError};
use crate::hash::fnv1a_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Entity selector as exchanged on the wire
///
/// `{"json": {...}}` carries a condition tree, `{"cel": "..."}` a CEL
/// expression evaluated by an externally supplied [`CelEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    Json(Value),
    Cel(String),
}

impl Selector {
    /// Selector admitting every entity
    pub fn match_all() -> Self {
        Selector::Json(Condition::match_all().to_value())
    }

    /// Build a JSON selector from a parsed condition
    pub fn from_condition(condition: &Condition) -> Self {
        Selector::Json(condition.to_value())
    }

    /// Deterministic cache key: FNV-1a over canonical JSON, 16 hex chars
    ///
    /// JSON selectors that parse are hashed in their canonical form so that
    /// formatting differences do not change the key.
    pub fn hash(&self) -> String {
        let canonical = match self {
            Selector::Json(raw) => match Condition::parse(raw) {
                Ok(condition) => serde_json::json!({ "json": condition.to_value() }),
                Err(_) => serde_json::json!({ "json": raw }),
            },
            Selector::Cel(expr) => serde_json::json!({ "cel": expr }),
        };
        fnv1a_hex(canonical.to_string().as_bytes())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Json(raw) => write!(f, "json:{}", raw),
            Selector::Cel(expr) => write!(f, "cel:{}", expr),
        }
    }
}

/// CEL dialect plug-in
pub trait CelEngine: Send + Sync {
    /// Validate that an expression compiles
    fn compile(&self, expression: &str) -> Result<()>;

    /// Evaluate an expression against an entity document
    fn evaluate(&self, expression: &str, document: &Value) -> Result<bool>;
}

/// Evaluates selectors against serializable entities
#[derive(Clone, Default)]
pub struct SelectorEvaluator {
    cel: Option<Arc<dyn CelEngine>>,
}

impl fmt::Debug for SelectorEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorEvaluator")
            .field("cel", &self.cel.is_some())
            .finish()
    }
}

impl SelectorEvaluator {
    /// Evaluator supporting JSON selectors only
    pub fn new() -> Self {
        Self { cel: None }
    }

    /// Attach a CEL engine
    pub fn with_cel_engine(mut self, engine: Arc<dyn CelEngine>) -> Self {
        self.cel = Some(engine);
        self
    }

    /// Check whether `entity` is admitted by `selector`
    pub fn matches<T: Serialize>(&self, selector: &Selector, entity: &T) -> Result<bool> {
        let document = serde_json::to_value(entity)
            .map_err(|e| SelectorError::Serialization(e.to_string()))?;
        self.matches_document(selector, &document)
    }

    /// Check a pre-projected entity document
    pub fn matches_document(&self, selector: &Selector, document: &Value) -> Result<bool> {
        let matched = match selector {
            Selector::Json(raw) => Condition::parse(raw)?.evaluate(document)?,
            Selector::Cel(expr) => self.cel_engine(expr)?.evaluate(expr, document)?,
        };
        trace!(selector = %selector, matched, "Evaluated selector");
        Ok(matched)
    }

    /// Optional selector: absence admits every entity
    pub fn matches_optional<T: Serialize>(
        &self,
        selector: Option<&Selector>,
        entity: &T,
    ) -> Result<bool> {
        match selector {
            Some(selector) => self.matches(selector, entity),
            None => Ok(true),
        }
    }

    /// Validate a selector without evaluating it
    pub fn validate(&self, selector: &Selector) -> Result<()> {
        match selector {
            Selector::Json(raw) => Condition::parse(raw).map(|_| ()),
            Selector::Cel(expr) => self.cel_engine(expr)?.compile(expr),
        }
    }

    fn cel_engine(&self, expr: &str) -> Result<&Arc<dyn CelEngine>> {
        self.cel
            .as_ref()
            .ok_or_else(|| SelectorError::CelUnavailable(expr.to_string()))
    }
}

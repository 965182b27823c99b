//! Keel Selector - entity predicates
//!
//! Selectors decide which resources a deployment or environment covers,
//! which release targets a policy applies to, and which versions a
//! version-selector rule admits.
//!
//! ## Dialects
//!
//! - **JSON**: a recursive condition tree (string-field, metadata, date,
//!   comparison) evaluated here. See [`Condition`].
//! - **CEL**: an expression string handed to a plugged-in [`CelEngine`].
//!
//! ## Example
//!
//! ```rust
//! use keel_selector::{Selector, SelectorEvaluator};
//! use serde_json::json;
//!
//! let selector = Selector::Json(json!({
//!     "type": "metadata", "key": "env", "operator": "equals", "value": "prod"
//! }));
//! let evaluator = SelectorEvaluator::new();
//! let resource = json!({"id": "r1", "metadata": {"env": "prod"}});
//! assert!(evaluator.matches_document(&selector, &resource).unwrap());
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod condition;
pub mod error;
pub mod evaluate;
pub mod hash;
pub mod selector;

pub use condition::{
    ComparisonOperator, Condition, DateField, DateOperator, StringField, StringOperator,
    MAX_DEPTH,
};
pub use error::{Result, SelectorError};
pub use evaluate::truncate_to_seconds;
pub use selector::{CelEngine, Selector, SelectorEvaluator};

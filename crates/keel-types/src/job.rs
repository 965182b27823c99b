//! Jobs, their status machine, verifications and job agents

use crate::error::{Result, TypesError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Job status
///
/// `pending → inProgress → {terminal | actionRequired}`; `actionRequired`
/// may return to `inProgress`. Every non-processing state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    InProgress,
    ActionRequired,
    Successful,
    Failure,
    Cancelled,
    Skipped,
    InvalidJobAgent,
    InvalidIntegration,
    ExternalRunNotFound,
}

impl JobStatus {
    /// Pending, in progress or awaiting action
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::InProgress | JobStatus::ActionRequired
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_processing()
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, JobStatus::Successful)
    }

    /// Terminal outcomes that count against a release's retry budget
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            JobStatus::Failure
                | JobStatus::InvalidJobAgent
                | JobStatus::InvalidIntegration
                | JobStatus::ExternalRunNotFound
        )
    }

    /// Whether the state machine permits moving to `next`
    ///
    /// Re-asserting the current status is accepted so that replayed status
    /// events are harmless.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::InProgress => next != JobStatus::Pending,
            JobStatus::ActionRequired => {
                next == JobStatus::InProgress || next.is_terminal()
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "inProgress",
            JobStatus::ActionRequired => "actionRequired",
            JobStatus::Successful => "successful",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
            JobStatus::InvalidJobAgent => "invalidJobAgent",
            JobStatus::InvalidIntegration => "invalidIntegration",
            JobStatus::ExternalRunNotFound => "externalRunNotFound",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An execution of a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,

    pub release_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent_id: Option<String>,

    /// Merged agent + deployment config the job was dispatched with
    #[serde(default)]
    pub job_agent_config: Value,

    pub status: JobStatus,

    /// Dispatcher error text or integration status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh pending job for `release_id`
    pub fn pending(id: impl Into<String>, release_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            release_id: release_id.into(),
            job_agent_id: None,
            job_agent_config: Value::Object(serde_json::Map::new()),
            status: JobStatus::Pending,
            message: None,
            external_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a status change, stamping start and completion times
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TypesError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Verification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Running,
    Passed,
    Failed,
    Cancelled,
}

/// Post-deployment verification attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobVerification {
    pub id: String,
    pub job_id: String,
    pub status: VerificationStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// An integration that runs jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAgent {
    pub id: String,

    #[serde(default)]
    pub workspace_id: String,

    pub name: String,

    /// Integration tag, copied into the merged config when it has none
    #[serde(rename = "type")]
    pub agent_type: String,

    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl JobAgent {
    /// Deep-merge the deployment's overrides over this agent's config
    pub fn merged_config(&self, overrides: &serde_json::Map<String, Value>) -> Value {
        let mut merged = Value::Object(self.config.clone());
        deep_merge(&mut merged, &Value::Object(overrides.clone()));
        if let Value::Object(map) = &mut merged {
            map.entry("type")
                .or_insert_with(|| Value::String(self.agent_type.clone()));
        }
        merged
    }
}

/// Typed job agent configuration, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobAgentConfig {
    #[serde(rename_all = "camelCase")]
    GithubApp {
        installation_id: i64,
        owner: String,
        repo: String,
        workflow_id: i64,
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        git_ref: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ArgoCd {
        server_url: String,
        api_key: String,
        template: String,
    },

    #[serde(rename_all = "camelCase")]
    Tfe {
        address: String,
        organization: String,
        token: String,
        template: String,
    },

    #[serde(rename_all = "camelCase")]
    TestRunner {
        #[serde(default)]
        delay_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<JobStatus>,
    },

    Custom {
        #[serde(flatten)]
        fields: serde_json::Map<String, Value>,
    },
}

impl JobAgentConfig {
    /// Parse a merged config document
    pub fn parse(merged: &Value) -> Result<Self> {
        serde_json::from_value(merged.clone()).map_err(|e| TypesError::JobAgentConfig(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobAgentConfig::GithubApp { .. } => "github-app",
            JobAgentConfig::ArgoCd { .. } => "argo-cd",
            JobAgentConfig::Tfe { .. } => "tfe",
            JobAgentConfig::TestRunner { .. } => "test-runner",
            JobAgentConfig::Custom { .. } => "custom",
        }
    }
}

/// Recursively merge `overlay` into `base`; non-object values replace
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

//! Workspace event envelope
//!
//! Events travel on the broker topic as JSON, keyed by workspace id so that
//! one workspace's events stay ordered within a partition.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

/// Entity family an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Resource,
    ResourceProvider,
    ResourceVariable,
    Deployment,
    DeploymentVersion,
    DeploymentVariable,
    Environment,
    Policy,
    JobAgent,
    System,
    Job,
    JobVerification,
    UserApproval,
    ReleaseTarget,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Resource => "resource",
            Subject::ResourceProvider => "resource-provider",
            Subject::ResourceVariable => "resource-variable",
            Subject::Deployment => "deployment",
            Subject::DeploymentVersion => "deployment-version",
            Subject::DeploymentVariable => "deployment-variable",
            Subject::Environment => "environment",
            Subject::Policy => "policy",
            Subject::JobAgent => "job-agent",
            Subject::System => "system",
            Subject::Job => "job",
            Subject::JobVerification => "job-verification",
            Subject::UserApproval => "user-approval",
            Subject::ReleaseTarget => "release-target",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "resource" => Subject::Resource,
            "resource-provider" => Subject::ResourceProvider,
            "resource-variable" => Subject::ResourceVariable,
            "deployment" => Subject::Deployment,
            "deployment-version" => Subject::DeploymentVersion,
            "deployment-variable" => Subject::DeploymentVariable,
            "environment" => Subject::Environment,
            "policy" => Subject::Policy,
            "job-agent" => Subject::JobAgent,
            "system" => Subject::System,
            "job" => Subject::Job,
            "job-verification" => Subject::JobVerification,
            "user-approval" => Subject::UserApproval,
            "release-target" => Subject::ReleaseTarget,
            _ => return None,
        })
    }

    /// Whether the subject follows the created / updated / deleted lifecycle
    fn has_crud(&self) -> bool {
        !matches!(
            self,
            Subject::Job | Subject::JobVerification | Subject::UserApproval | Subject::ReleaseTarget
        )
    }
}

/// What happened to the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    SetResources,
    StatusUpdated,
    Recorded,
    Redeploy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::SetResources => "set-resources",
            Action::StatusUpdated => "status-updated",
            Action::Recorded => "recorded",
            Action::Redeploy => "redeploy",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Action::Created,
            "updated" => Action::Updated,
            "deleted" => Action::Deleted,
            "set-resources" => Action::SetResources,
            "status-updated" => Action::StatusUpdated,
            "recorded" => Action::Recorded,
            "redeploy" => Action::Redeploy,
            _ => return None,
        })
    }
}

/// A recognized `subject.action` event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType {
    pub subject: Subject,
    pub action: Action,
}

impl EventType {
    pub const fn new(subject: Subject, action: Action) -> Self {
        Self { subject, action }
    }

    fn is_supported(&self) -> bool {
        match self.action {
            Action::Created | Action::Updated | Action::Deleted => self.subject.has_crud(),
            Action::SetResources => self.subject == Subject::ResourceProvider,
            Action::StatusUpdated => {
                matches!(self.subject, Subject::Job | Subject::JobVerification)
            }
            Action::Recorded => self.subject == Subject::UserApproval,
            Action::Redeploy => self.subject == Subject::ReleaseTarget,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subject.as_str(), self.action.as_str())
    }
}

impl FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || EngineError::Validation(format!("unknown event type '{}'", s));
        let (subject, action) = s.split_once('.').ok_or_else(unknown)?;
        let event_type = EventType::new(
            Subject::parse(subject).ok_or_else(unknown)?,
            Action::parse(action).ok_or_else(unknown)?,
        );
        if !event_type.is_supported() {
            return Err(unknown());
        }
        Ok(event_type)
    }
}

impl TryFrom<String> for EventType {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.to_string()
    }
}

/// One event on the workspace topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub workspace_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Entity document; shape depends on `event_type`
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(
        workspace_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        data: &T,
    ) -> Result<Self> {
        Ok(Self {
            workspace_id: workspace_id.into(),
            event_type,
            timestamp,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize `data` into the entity the event type carries
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            EngineError::Validation(format!("{} payload: {}", self.event_type, e))
        })
    }
}

/// Read newline-delimited envelopes, skipping blank lines
pub fn read_envelopes<R: BufRead>(reader: R) -> Result<Vec<Envelope>> {
    let mut envelopes = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope = serde_json::from_str(&line).map_err(|e| {
            EngineError::Validation(format!("line {}: {}", index + 1, e))
        })?;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

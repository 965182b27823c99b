//! Job dispatch to integrations
//!
//! Real runners (GitHub Actions, Argo CD, Terraform Cloud, custom agents)
//! live outside the engine; dispatching to them is recorded and left to the
//! integration. The test runner is simulated in process: after its
//! configured delay it reports the job's final status back onto the event
//! topic, exactly as an external runner would.

use crate::event::{Action, Envelope, EventType, Subject};
use crate::handlers::JobStatusUpdate;
use async_trait::async_trait;
use keel_broker::Producer;
use keel_release::{Dispatcher, ReleaseError};
use keel_types::{Clock, Job, JobAgentConfig, JobStatus, SharedClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct IntegrationDispatcher {
    workspace_id: String,
    events: Option<Arc<dyn Producer>>,
    clock: SharedClock,
}

impl fmt::Debug for IntegrationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationDispatcher")
            .field("workspace_id", &self.workspace_id)
            .field("reports_status", &self.events.is_some())
            .finish()
    }
}

impl IntegrationDispatcher {
    pub fn new(workspace_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            events: None,
            clock,
        }
    }

    /// Publish simulated runner status updates to `producer`
    pub fn with_events(mut self, producer: Arc<dyn Producer>) -> Self {
        self.events = Some(producer);
        self
    }

    fn status_event(&self, job: &Job, status: JobStatus) -> keel_release::Result<Vec<u8>> {
        let update = JobStatusUpdate {
            id: job.id.clone(),
            status,
            message: Some(format!("test runner finished with {}", status)),
            external_id: None,
        };
        Envelope::new(
            self.workspace_id.clone(),
            EventType::new(Subject::Job, Action::StatusUpdated),
            self.clock.now(),
            &update,
        )
        .and_then(|envelope| envelope.encode())
        .map_err(|e| ReleaseError::Dispatch(e.to_string()))
    }
}

#[async_trait]
impl Dispatcher for IntegrationDispatcher {
    async fn dispatch(&self, job: &Job, config: &JobAgentConfig) -> keel_release::Result<()> {
        let JobAgentConfig::TestRunner {
            delay_seconds,
            status,
        } = config
        else {
            info!(job_id = %job.id, integration = config.type_name(), "Job handed to integration");
            return Ok(());
        };

        let Some(producer) = self.events.clone() else {
            debug!(job_id = %job.id, "Test runner has no event producer; job left pending");
            return Ok(());
        };
        let status = status.unwrap_or(JobStatus::Successful);
        let payload = self.status_event(job, status)?;
        let key = self.workspace_id.clone().into_bytes();
        let delay = Duration::from_secs(*delay_seconds);
        let job_id = job.id.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match producer.publish(&key, &payload).await {
                Ok(delivery) => {
                    debug!(job_id = %job_id, offset = delivery.offset, "Test runner reported status")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Test runner failed to report status"),
            }
        });
        info!(job_id = %job.id, delay_seconds, status = %status, "Job dispatched to test runner");
        Ok(())
    }
}

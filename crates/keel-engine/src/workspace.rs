//! Workspace façade
//!
//! One [`Workspace`] owns the store and the reconciliation pipeline for a
//! single workspace id. Events go in through [`Workspace::apply`]; state and
//! policy evaluations come out through [`Workspace::state`] and
//! [`Workspace::evaluate_policies`].

use crate::batch::BatchCache;
use crate::dispatch::IntegrationDispatcher;
use crate::error::{EngineError, Result};
use crate::event::Envelope;
use crate::handlers::{EventHandler, Handled};
use crate::processors::{
    DesiredReleaseProcessor, KindRouter, QueueScheduler, SelectorEvalProcessor,
    KIND_DESIRED_RELEASE, KIND_SELECTOR_EVAL,
};
use keel_broker::Producer;
use keel_policy::DEFAULT_MAX_RETRIES;
use keel_queue::ReconcileQueue;
use keel_release::{
    Dispatcher, EligibilityChecker, Executor, Orchestrator, Planner, ProcessReport, ReleaseManager,
    StateIndex, TargetEvaluation, TargetState,
};
use keel_store::{MutationContext, Store};
use keel_types::{
    CancelToken, EntityKind, Job, ReleaseTarget, Resource, SharedClock, SystemClock,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Assembles a [`Workspace`]
pub struct WorkspaceBuilder {
    id: String,
    queue: Arc<dyn ReconcileQueue>,
    store: Option<Arc<Store>>,
    clock: SharedClock,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    events: Option<Arc<dyn Producer>>,
    default_max_retries: u32,
    batch_ttl: Duration,
}

impl WorkspaceBuilder {
    pub fn new(id: impl Into<String>, queue: Arc<dyn ReconcileQueue>) -> Self {
        Self {
            id: id.into(),
            queue,
            store: None,
            clock: Arc::new(SystemClock),
            dispatcher: None,
            events: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            batch_ttl: Duration::from_secs(300),
        }
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the integration dispatcher
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Producer for events the engine emits itself (test-runner status)
    pub fn with_events(mut self, producer: Arc<dyn Producer>) -> Self {
        self.events = Some(producer);
        self
    }

    pub fn with_default_max_retries(mut self, max: u32) -> Self {
        self.default_max_retries = max;
        self
    }

    pub fn with_batch_ttl(mut self, ttl: Duration) -> Self {
        self.batch_ttl = ttl;
        self
    }

    pub fn build(self) -> Arc<Workspace> {
        let store = self.store.unwrap_or_default();
        let clock = self.clock;
        let dispatcher: Arc<dyn Dispatcher> = match (self.dispatcher, self.events) {
            (Some(dispatcher), _) => dispatcher,
            (None, Some(producer)) => Arc::new(
                IntegrationDispatcher::new(self.id.clone(), clock.clone()).with_events(producer),
            ),
            (None, None) => Arc::new(IntegrationDispatcher::new(self.id.clone(), clock.clone())),
        };

        let planner = Planner::new(store.clone(), clock.clone());
        let orchestrator = Orchestrator::new(
            planner.clone(),
            EligibilityChecker::new(store.clone())
                .with_default_max_retries(self.default_max_retries),
            Executor::new(store.clone(), dispatcher, clock.clone()),
        );
        let manager = Arc::new(
            ReleaseManager::new(
                store.clone(),
                Arc::new(StateIndex::new(planner)),
                orchestrator,
                clock.clone(),
            )
            .with_scheduler(Arc::new(QueueScheduler::new(self.queue.clone(), self.id.clone()))),
        );
        let batches = Arc::new(BatchCache::new(self.batch_ttl, clock.clone()));
        let handler = EventHandler::new(
            self.id.clone(),
            store.clone(),
            batches.clone(),
            self.queue.clone(),
            clock.clone(),
        );

        Arc::new(Workspace {
            id: self.id,
            store,
            queue: self.queue,
            batches,
            handler,
            manager,
            clock,
        })
    }
}

pub struct Workspace {
    id: String,
    store: Arc<Store>,
    queue: Arc<dyn ReconcileQueue>,
    batches: Arc<BatchCache>,
    handler: EventHandler,
    manager: Arc<ReleaseManager>,
    clock: SharedClock,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("store", &self.store)
            .finish()
    }
}

impl Workspace {
    pub fn builder(id: impl Into<String>, queue: Arc<dyn ReconcileQueue>) -> WorkspaceBuilder {
        WorkspaceBuilder::new(id, queue)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn ReconcileQueue> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<ReleaseManager> {
        &self.manager
    }

    /// Processor for this workspace's reconcile-queue kinds
    pub fn processor(&self) -> KindRouter {
        KindRouter::new()
            .route(
                KIND_DESIRED_RELEASE,
                Arc::new(DesiredReleaseProcessor::new(
                    self.store.clone(),
                    self.manager.clone(),
                    self.clock.clone(),
                )),
            )
            .route(
                KIND_SELECTOR_EVAL,
                Arc::new(SelectorEvalProcessor::new(
                    self.store.clone(),
                    self.manager.clone(),
                )),
            )
    }

    /// Publish a resource batch for a later `set-resources` event
    pub fn publish_batch(&self, resources: Vec<Resource>) -> String {
        self.batches.put(resources)
    }

    pub fn purge_expired_batches(&self) -> usize {
        self.batches.purge_expired()
    }

    /// Apply one event and reconcile whatever it changed
    #[instrument(skip_all, fields(workspace_id = %self.id, event_type = %envelope.event_type))]
    pub async fn apply(&self, envelope: &Envelope, cancel: &CancelToken) -> Result<ProcessReport> {
        if envelope.workspace_id != self.id {
            return Err(EngineError::Validation(format!(
                "event for workspace '{}' delivered to '{}'",
                envelope.workspace_id, self.id
            )));
        }

        let ctx = MutationContext::new().with_cancel(cancel.clone());
        if let Handled::Redeploy(target) = self.handler.handle(&ctx, envelope).await? {
            let job = self.redeploy(&target, cancel).await?;
            return Ok(ProcessReport {
                targets_affected: 1,
                jobs_created: job.into_iter().collect(),
                ..Default::default()
            });
        }

        let Some(changes) = ctx.changes().filter(|c| !c.is_empty()) else {
            return Ok(ProcessReport::default());
        };
        let report = self
            .manager
            .process_changes(&MutationContext::detached(), changes, cancel)
            .await?;
        info!(
            changes = changes.len(),
            targets = report.targets_affected,
            jobs_created = report.jobs_created.len(),
            jobs_cancelled = report.jobs_cancelled.len(),
            failures = report.failures.len(),
            "Event applied"
        );
        Ok(report)
    }

    /// Indexed state of one target, computed on first access
    pub async fn state(&self, target: &ReleaseTarget, cancel: &CancelToken) -> Result<TargetState> {
        Ok(self.manager.state().get(target, cancel).await?)
    }

    /// Per-policy evaluations of the target's desired version
    ///
    /// `None` when the target has no desired release.
    pub async fn evaluate_policies(
        &self,
        target: &ReleaseTarget,
        cancel: &CancelToken,
    ) -> Result<Option<TargetEvaluation>> {
        let state = self.state(target, cancel).await?;
        let Some(desired) = state.desired else {
            return Ok(None);
        };
        let evaluation = self
            .manager
            .orchestrator()
            .planner()
            .evaluate_policies(target, &desired.release.version)
            .await?;
        Ok(Some(evaluation))
    }

    /// Operator redeploy of the desired release, bypassing eligibility
    pub async fn redeploy(&self, target: &ReleaseTarget, cancel: &CancelToken) -> Result<Option<Job>> {
        if !self.store.release_targets.contains(&target.key()) {
            return Err(EngineError::not_found(EntityKind::ReleaseTarget, target.key()));
        }
        Ok(self
            .manager
            .redeploy(&MutationContext::detached(), target, cancel)
            .await?)
    }
}

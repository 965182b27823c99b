//! Reconcile-queue processors
//!
//! Two kinds of work run through the queue:
//!
//! - `desired-release`: re-plan one release target and reconcile it.
//!   Enqueued for time-based re-evaluation and by verification updates.
//! - `selector-eval`: re-derive the release targets of one deployment or
//!   environment after its selector or systems changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_queue::{
    EnqueueParams, Item, PayloadInput, ProcessError, ProcessOutcome, Processor, ReconcileQueue,
    ScopeKey,
};
use keel_release::{ReevaluationScheduler, ReleaseError, ReleaseManager};
use keel_store::{MutationContext, Store, StoreError};
use keel_types::{CancelToken, Clock, ReleaseTarget, SharedClock};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const KIND_DESIRED_RELEASE: &str = "desired-release";
pub const KIND_SELECTOR_EVAL: &str = "selector-eval";

pub const SCOPE_RELEASE_TARGET: &str = "release-target";
pub const SCOPE_DEPLOYMENT: &str = "deployment";
pub const SCOPE_ENVIRONMENT: &str = "environment";

/// Work item re-planning one target
pub fn desired_release_work(workspace_id: &str, target: &ReleaseTarget, reason: &str) -> EnqueueParams {
    EnqueueParams::new(ScopeKey::new(
        workspace_id,
        KIND_DESIRED_RELEASE,
        SCOPE_RELEASE_TARGET,
        target.key(),
    ))
    .with_payload(PayloadInput::new(
        reason,
        json!({
            "resourceId": target.resource_id,
            "environmentId": target.environment_id,
            "deploymentId": target.deployment_id,
        }),
    ))
}

/// Work item re-deriving the targets of a deployment or environment
pub fn selector_eval_work(workspace_id: &str, scope_type: &str, scope_id: &str) -> EnqueueParams {
    EnqueueParams::new(ScopeKey::new(
        workspace_id,
        KIND_SELECTOR_EVAL,
        scope_type,
        scope_id,
    ))
    .with_payload(PayloadInput::new("selector-changed", json!({ "id": scope_id })))
}

fn classify_release(err: ReleaseError) -> ProcessError {
    match err {
        ReleaseError::Cancelled => ProcessError::Cancelled,
        e if e.is_validation() => ProcessError::Fatal(e.to_string()),
        e => ProcessError::Retryable(e.to_string()),
    }
}

fn classify_store(err: StoreError) -> ProcessError {
    match err {
        StoreError::Cancelled => ProcessError::Cancelled,
        e => ProcessError::Fatal(e.to_string()),
    }
}

/// Re-plans and reconciles one release target
pub struct DesiredReleaseProcessor {
    store: Arc<Store>,
    manager: Arc<ReleaseManager>,
    clock: SharedClock,
}

impl DesiredReleaseProcessor {
    pub fn new(store: Arc<Store>, manager: Arc<ReleaseManager>, clock: SharedClock) -> Self {
        Self {
            store,
            manager,
            clock,
        }
    }
}

#[async_trait]
impl Processor for DesiredReleaseProcessor {
    #[instrument(skip_all, fields(target_key = %item.scope.scope_id, payloads = item.payloads.len()))]
    async fn process(
        &self,
        cancel: &CancelToken,
        item: &Item,
    ) -> Result<ProcessOutcome, ProcessError> {
        let key = &item.scope.scope_id;
        let Some(target) = self.store.release_targets.get(key) else {
            debug!("Release target gone; dropping work");
            return Ok(ProcessOutcome::Done);
        };

        let report = self
            .manager
            .reconcile_target(&MutationContext::detached(), &target, cancel)
            .await
            .map_err(classify_release)?;
        if let Some((_, error)) = report.failures.into_iter().next() {
            return Err(ProcessError::Retryable(error));
        }

        let next = self
            .manager
            .state()
            .peek(key)
            .desired
            .and_then(|d| d.next_evaluation_time);
        if let Some(at) = next {
            if let Ok(delay) = (at - self.clock.now()).to_std() {
                if !delay.is_zero() {
                    debug!(at = %at, "Desired release waiting; deferring");
                    return Ok(ProcessOutcome::RequeueAfter(delay));
                }
            }
        }
        Ok(ProcessOutcome::Done)
    }
}

/// Re-derives release targets for one deployment or environment
pub struct SelectorEvalProcessor {
    store: Arc<Store>,
    manager: Arc<ReleaseManager>,
}

impl SelectorEvalProcessor {
    pub fn new(store: Arc<Store>, manager: Arc<ReleaseManager>) -> Self {
        Self { store, manager }
    }
}

#[async_trait]
impl Processor for SelectorEvalProcessor {
    #[instrument(skip_all, fields(scope_type = %item.scope.scope_type, scope_id = %item.scope.scope_id))]
    async fn process(
        &self,
        cancel: &CancelToken,
        item: &Item,
    ) -> Result<ProcessOutcome, ProcessError> {
        let ctx = MutationContext::new().with_cancel(cancel.clone());
        let id = item.scope.scope_id.as_str();
        let diff = match item.scope.scope_type.as_str() {
            SCOPE_DEPLOYMENT => self.store.sync_deployment_targets(&ctx, id),
            SCOPE_ENVIRONMENT => self.store.sync_environment_targets(&ctx, id),
            other => {
                return Err(ProcessError::Fatal(format!(
                    "selector-eval does not handle scope type '{}'",
                    other
                )))
            }
        }
        .map_err(classify_store)?;

        if diff.is_empty() {
            return Ok(ProcessOutcome::Done);
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Release targets re-derived"
        );
        if let Some(changes) = ctx.changes() {
            self.manager
                .process_changes(&MutationContext::detached(), changes, cancel)
                .await
                .map_err(classify_release)?;
        }
        Ok(ProcessOutcome::Done)
    }
}

/// Routes claimed items to the processor registered for their kind
#[derive(Default)]
pub struct KindRouter {
    routes: HashMap<String, Arc<dyn Processor>>,
}

impl fmt::Debug for KindRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.routes.keys().collect();
        kinds.sort();
        f.debug_struct("KindRouter").field("kinds", &kinds).finish()
    }
}

impl KindRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, kind: &str, processor: Arc<dyn Processor>) -> Self {
        self.routes.insert(kind.to_string(), processor);
        self
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.routes.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl Processor for KindRouter {
    async fn process(
        &self,
        cancel: &CancelToken,
        item: &Item,
    ) -> Result<ProcessOutcome, ProcessError> {
        match self.routes.get(&item.scope.kind) {
            Some(processor) => processor.process(cancel, item).await,
            None => Err(ProcessError::Fatal(format!(
                "no processor for kind '{}'",
                item.scope.kind
            ))),
        }
    }
}

/// Schedules target re-evaluation as delayed `desired-release` work
pub struct QueueScheduler {
    queue: Arc<dyn ReconcileQueue>,
    workspace_id: String,
}

impl fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl QueueScheduler {
    pub fn new(queue: Arc<dyn ReconcileQueue>, workspace_id: impl Into<String>) -> Self {
        Self {
            queue,
            workspace_id: workspace_id.into(),
        }
    }
}

#[async_trait]
impl ReevaluationScheduler for QueueScheduler {
    async fn schedule(&self, target: &ReleaseTarget, at: DateTime<Utc>) -> keel_release::Result<()> {
        let params = desired_release_work(&self.workspace_id, target, "scheduled").with_not_before(at);
        self.queue
            .enqueue(params)
            .await
            .map_err(|e| ReleaseError::Scheduling(e.to_string()))?;
        debug!(target_key = %target.key(), at = %at, "Re-evaluation scheduled");
        Ok(())
    }
}

//! Gradual rollout rule
//!
//! Targets of a deployment within one environment are ranked by a hash of
//! `(target key, version id)`. At `t` seconds after the version was created,
//! the first `admitted(t)` ranks are allowed, where `admitted` is `0` for
//! `t <= 0`, `N` for `t >= T` and otherwise follows the schedule, rounding
//! down.

use crate::error::Result;
use crate::evaluation::{ActionType, RuleEvaluation};
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use chrono::Duration;
use keel_selector::{hash::fnv1a, truncate_to_seconds};
use keel_store::Store;
use keel_types::{ReleaseTarget, RolloutSchedule, SharedClock};
use std::sync::Arc;

const RULE_TYPE: &str = "gradual-rollout";

#[derive(Debug)]
pub struct GradualRolloutEvaluator {
    rule_id: String,
    duration_seconds: u64,
    schedule: RolloutSchedule,
    store: Arc<Store>,
    clock: SharedClock,
}

/// Number of targets admitted `elapsed` seconds into a rollout of `total`
/// targets over `duration` seconds
pub fn admitted_count(schedule: RolloutSchedule, elapsed: i64, duration: u64, total: u64) -> u64 {
    if duration == 0 {
        return total;
    }
    if elapsed <= 0 {
        return 0;
    }
    let elapsed = elapsed as u64;
    if elapsed >= duration {
        return total;
    }
    match schedule {
        RolloutSchedule::Linear => elapsed * total / duration,
        RolloutSchedule::Step { steps } => {
            let steps = u64::from(steps.max(1));
            let step = elapsed * steps / duration;
            step * total / steps
        }
    }
}

/// Seconds after version creation at which `rank` is first admitted
pub fn admission_offset(schedule: RolloutSchedule, rank: u64, duration: u64, total: u64) -> u64 {
    if duration == 0 || total == 0 {
        return 0;
    }
    let needed = rank + 1;
    let offset = match schedule {
        RolloutSchedule::Linear => div_ceil(needed * duration, total),
        RolloutSchedule::Step { steps } => {
            let steps = u64::from(steps.max(1));
            let step = div_ceil(needed * steps, total);
            div_ceil(step * duration, steps)
        }
    };
    offset.clamp(1, duration)
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

impl GradualRolloutEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        duration_seconds: u64,
        schedule: RolloutSchedule,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            duration_seconds,
            schedule,
            store,
            clock,
        }
    }

    /// Position of `target` among its peers, and the peer count
    fn rank(&self, target: &ReleaseTarget, version_id: &str) -> (u64, u64) {
        let mut peers: Vec<(u64, String)> = self
            .store
            .targets_for_deployment(&target.deployment_id)
            .into_iter()
            .filter(|t| t.environment_id == target.environment_id)
            .map(|t| {
                let key = t.key();
                (fnv1a(format!("{}:{}", key, version_id).as_bytes()), key)
            })
            .collect();
        let own_key = target.key();
        if !peers.iter().any(|(_, key)| *key == own_key) {
            peers.push((fnv1a(format!("{}:{}", own_key, version_id).as_bytes()), own_key.clone()));
        }
        peers.sort();
        let rank = peers
            .iter()
            .position(|(_, key)| *key == own_key)
            .unwrap_or(0) as u64;
        (rank, peers.len() as u64)
    }
}

#[async_trait]
impl RuleEvaluator for GradualRolloutEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::RELEASE_TARGET
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        5
    }

    fn permits_fallback(&self) -> bool {
        true
    }

    async fn evaluate(&self, scope: &Scope) -> Result<RuleEvaluation> {
        let version = scope.require_version(RULE_TYPE)?;
        let target = scope.require_release_target(RULE_TYPE)?;

        let (rank, total) = self.rank(target, &version.id);
        let start = truncate_to_seconds(version.created_at);
        let elapsed = (truncate_to_seconds(self.clock.now()) - start).num_seconds();
        let admitted = admitted_count(self.schedule, elapsed, self.duration_seconds, total);

        if rank < admitted {
            return Ok(RuleEvaluation::allowed(format!(
                "Rollout position {} of {} admitted",
                rank + 1,
                total
            ))
            .with_detail("rank", rank)
            .with_detail("admitted", admitted));
        }

        let offset = admission_offset(self.schedule, rank, self.duration_seconds, total);
        let at = start + Duration::seconds(offset as i64);
        Ok(RuleEvaluation::pending(
            ActionType::Wait,
            format!(
                "Rollout position {} of {} not yet admitted ({} admitted)",
                rank + 1,
                total,
                admitted
            ),
        )
        .with_detail("rank", rank)
        .with_detail("admitted", admitted)
        .with_detail("rolloutStartTime", start.to_rfc3339())
        .with_next_evaluation_time(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::fixture;
    use keel_store::MutationContext;
    use keel_types::Resource;

    #[test]
    fn test_admitted_boundaries() {
        let linear = RolloutSchedule::Linear;
        assert_eq!(admitted_count(linear, -5, 100, 10), 0);
        assert_eq!(admitted_count(linear, 0, 100, 10), 0);
        assert_eq!(admitted_count(linear, 9, 100, 10), 0);
        assert_eq!(admitted_count(linear, 10, 100, 10), 1);
        assert_eq!(admitted_count(linear, 55, 100, 10), 5);
        assert_eq!(admitted_count(linear, 100, 100, 10), 10);
        assert_eq!(admitted_count(linear, 500, 100, 10), 10);
        assert_eq!(admitted_count(linear, 1, 0, 10), 10);
    }

    #[test]
    fn test_step_schedule() {
        let step = RolloutSchedule::Step { steps: 4 };
        assert_eq!(admitted_count(step, 24, 100, 8), 0);
        assert_eq!(admitted_count(step, 25, 100, 8), 2);
        assert_eq!(admitted_count(step, 74, 100, 8), 4);
        assert_eq!(admitted_count(step, 75, 100, 8), 6);
    }

    #[test]
    fn test_admission_offset_matches_count() {
        for schedule in [RolloutSchedule::Linear, RolloutSchedule::Step { steps: 3 }] {
            for rank in 0..7u64 {
                let offset = admission_offset(schedule, rank, 90, 7);
                assert!(admitted_count(schedule, offset as i64, 90, 7) > rank);
                assert!(admitted_count(schedule, offset as i64 - 1, 90, 7) <= rank);
            }
        }
    }

    async fn count_allowed(
        evaluator: &GradualRolloutEvaluator,
        fx: &crate::rules::testing::Fixture,
        targets: &[ReleaseTarget],
    ) -> usize {
        let mut allowed = 0;
        for target in targets {
            if evaluator.evaluate(&fx.scope_for("v1", target)).await.unwrap().allowed {
                allowed += 1;
            }
        }
        allowed
    }

    #[tokio::test]
    async fn test_targets_admitted_progressively() {
        let fx = fixture();
        let ctx = MutationContext::detached();
        for i in 2..=4 {
            fx.store
                .resources
                .upsert(&ctx, Resource::new(format!("r{}", i), format!("c{}", i), fx.t0))
                .unwrap();
        }
        fx.store.sync_all_targets(&ctx).unwrap();
        let evaluator = GradualRolloutEvaluator::new(
            "g",
            400,
            RolloutSchedule::Linear,
            fx.store.clone(),
            Arc::new(fx.clock.clone()),
        );

        let targets = fx.store.targets_for_deployment("d1");
        assert_eq!(targets.len(), 4);

        assert_eq!(count_allowed(&evaluator, &fx, &targets).await, 0);
        fx.clock.set(fx.t0 + Duration::seconds(100));
        assert_eq!(count_allowed(&evaluator, &fx, &targets).await, 1);
        fx.clock.set(fx.t0 + Duration::seconds(250));
        assert_eq!(count_allowed(&evaluator, &fx, &targets).await, 2);
        fx.clock.set(fx.t0 + Duration::seconds(400));
        assert_eq!(count_allowed(&evaluator, &fx, &targets).await, 4);
    }
}

//! Deployment window rule
//!
//! Windows recur weekly in UTC. A window whose end is not after its start
//! spans midnight into the following day. With `deny` set, windows are
//! blackout periods instead.

use crate::error::Result;
use crate::evaluation::{ActionType, RuleEvaluation};
use crate::evaluator::RuleEvaluator;
use crate::scope::{Scope, ScopeFields};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use keel_types::{SharedClock, TimeWindow};

const RULE_TYPE: &str = "deployment-window";

#[derive(Debug)]
pub struct DeploymentWindowEvaluator {
    rule_id: String,
    windows: Vec<TimeWindow>,
    deny: bool,
    clock: SharedClock,
}

/// Concrete occurrence of a window starting on `date`
fn occurrence(window: &TimeWindow, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(window.start).and_utc();
    let mut end = date.and_time(window.end).and_utc();
    if end <= start {
        end += Duration::days(1);
    }
    (start, end)
}

/// Occurrences starting within `[from - 1 day, from + 8 days]`
fn occurrences_around(windows: &[TimeWindow], from: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let today = from.date_naive();
    let mut out = Vec::new();
    for offset in -1..=8 {
        let date = today + Duration::days(offset);
        for window in windows {
            if window.days.contains(&date.weekday()) {
                out.push(occurrence(window, date));
            }
        }
    }
    out
}

impl DeploymentWindowEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        windows: Vec<TimeWindow>,
        deny: bool,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            windows,
            deny,
            clock,
        }
    }

    /// End of the occurrence containing `now`, if any
    fn containing_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        occurrences_around(&self.windows, now)
            .into_iter()
            .filter(|(start, end)| *start <= now && now < *end)
            .map(|(_, end)| end)
            .max()
    }

    fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        occurrences_around(&self.windows, now)
            .into_iter()
            .map(|(start, _)| start)
            .filter(|start| *start > now)
            .min()
    }
}

#[async_trait]
impl RuleEvaluator for DeploymentWindowEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::NONE
    }

    fn rule_type(&self) -> &'static str {
        RULE_TYPE
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        1
    }

    async fn evaluate(&self, _scope: &Scope) -> Result<RuleEvaluation> {
        let now = keel_selector::truncate_to_seconds(self.clock.now());
        let inside = self.containing_end(now);

        match (self.deny, inside) {
            (false, Some(end)) => Ok(RuleEvaluation::allowed("Inside deployment window")
                .with_detail("windowEnd", end.to_rfc3339())),
            (true, None) => Ok(RuleEvaluation::allowed("Outside deployment blackout")),
            (false, None) => {
                let mut result =
                    RuleEvaluation::pending(ActionType::Wait, "Outside deployment window");
                if let Some(open) = self.next_open(now) {
                    result = result
                        .with_detail("nextWindowStart", open.to_rfc3339())
                        .with_next_evaluation_time(open);
                }
                Ok(result)
            }
            (true, Some(end)) => Ok(RuleEvaluation::pending(
                ActionType::Wait,
                "Inside deployment blackout",
            )
            .with_detail("blackoutEnd", end.to_rfc3339())
            .with_next_evaluation_time(end)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use keel_types::ManualClock;
    use std::sync::Arc;

    fn business_hours() -> Vec<TimeWindow> {
        vec![TimeWindow {
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        }]
    }

    fn at(clock: &ManualClock, y: i32, m: u32, d: u32, h: u32, min: u32) {
        clock.set(Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap());
    }

    #[tokio::test]
    async fn test_allow_window() {
        // 2024-03-04 is a Monday
        let clock = ManualClock::new(Utc::now());
        let evaluator =
            DeploymentWindowEvaluator::new("w", business_hours(), false, Arc::new(clock.clone()));

        at(&clock, 2024, 3, 4, 10, 0);
        assert!(evaluator.evaluate(&Scope::new()).await.unwrap().allowed);

        at(&clock, 2024, 3, 4, 17, 0);
        let result = evaluator.evaluate(&Scope::new()).await.unwrap();
        assert!(result.action_required);
        assert_eq!(
            result.next_evaluation_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap())
        );

        at(&clock, 2024, 3, 9, 12, 0);
        let result = evaluator.evaluate(&Scope::new()).await.unwrap();
        assert_eq!(
            result.next_evaluation_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_blackout_window() {
        let clock = ManualClock::new(Utc::now());
        let overnight = vec![TimeWindow {
            days: vec![Weekday::Fri],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        }];
        let evaluator = DeploymentWindowEvaluator::new("w", overnight, true, Arc::new(clock.clone()));

        // Saturday 02:00 falls in Friday's overnight blackout
        at(&clock, 2024, 3, 9, 2, 0);
        let result = evaluator.evaluate(&Scope::new()).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(
            result.next_evaluation_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 6, 0, 0).unwrap())
        );

        at(&clock, 2024, 3, 9, 7, 0);
        assert!(evaluator.evaluate(&Scope::new()).await.unwrap().allowed);
    }
}

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::SubscriptionInstance;

/// Which eligible instance a draw is charged against.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Largest remaining balance first, spreading load across headroom.
    #[default]
    LargestRemaining,
    /// Earliest `end_at` first, draining grants before they lapse.
    SoonestExpiry,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::LargestRemaining => "largest_remaining",
            SelectionPolicy::SoonestExpiry => "soonest_expiry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "largest_remaining" => Some(SelectionPolicy::LargestRemaining),
            "soonest_expiry" => Some(SelectionPolicy::SoonestExpiry),
            _ => None,
        }
    }

    fn compare(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let primary = match self {
            SelectionPolicy::LargestRemaining => b.remaining.cmp(&a.remaining),
            SelectionPolicy::SoonestExpiry => a.instance.end_at.cmp(&b.instance.end_at),
        };
        primary.then(a.instance.id.cmp(&b.instance.id))
    }
}

struct Candidate<'a> {
    instance: &'a SubscriptionInstance,
    remaining: i64,
}

/// key: allocation-selector -> pick the instance to draw from
///
/// Only instances effectively active at `now` whose remaining balance for
/// `resource` covers `amount` qualify. Ties fall to the lowest instance id.
pub fn select_candidate<'a>(
    instances: &'a [SubscriptionInstance],
    resource: &str,
    amount: i64,
    policy: SelectionPolicy,
    now: DateTime<Utc>,
) -> Option<&'a SubscriptionInstance> {
    instances
        .iter()
        .filter(|instance| instance.is_effectively_active(now))
        .map(|instance| Candidate {
            instance,
            remaining: instance.quota_info(resource).remaining,
        })
        .filter(|candidate| candidate.remaining >= amount)
        .min_by(|a, b| policy.compare(a, b))
        .map(|candidate| candidate.instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::models::{InstanceStatus, QuotaMap};
    use chrono::Duration;

    fn instance(id: i64, granted: i64, used: i64, ends_in_days: i64) -> SubscriptionInstance {
        let now = Utc::now();
        let mut consumed = QuotaMap::new();
        if used > 0 {
            consumed.insert("gpt-4".to_string(), used);
        }
        SubscriptionInstance {
            id,
            user_id: 7,
            plan_id: 1,
            plan_name: "Starter".to_string(),
            status: InstanceStatus::Active,
            start_at: now - Duration::days(1),
            end_at: now + Duration::days(ends_in_days),
            granted: QuotaMap::from([("gpt-4".to_string(), granted)]),
            remaining: QuotaMap::from([("gpt-4".to_string(), granted - used)]),
            consumed,
            purchase_price_cents: 0,
            payment_method: None,
            payment_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn picks_largest_remaining_balance() {
        let candidates = vec![instance(1, 5, 0, 3), instance(2, 50, 0, 20)];
        let chosen = select_candidate(
            &candidates,
            "gpt-4",
            10,
            SelectionPolicy::LargestRemaining,
            Utc::now(),
        )
        .expect("instance with 50 remaining qualifies");
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn ties_break_on_lowest_id() {
        let candidates = vec![instance(9, 40, 0, 3), instance(4, 40, 0, 20), instance(6, 40, 0, 1)];
        for _ in 0..3 {
            let chosen = select_candidate(
                &candidates,
                "gpt-4",
                1,
                SelectionPolicy::LargestRemaining,
                Utc::now(),
            )
            .unwrap();
            assert_eq!(chosen.id, 4);
        }
    }

    #[test]
    fn soonest_expiry_policy_drains_lapsing_grants_first() {
        let candidates = vec![instance(1, 100, 0, 20), instance(2, 20, 0, 2)];
        let chosen = select_candidate(
            &candidates,
            "gpt-4",
            10,
            SelectionPolicy::SoonestExpiry,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn returns_none_when_nothing_covers_the_amount() {
        let candidates = vec![instance(1, 10, 8, 3), instance(2, 5, 0, 20)];
        assert!(select_candidate(
            &candidates,
            "gpt-4",
            6,
            SelectionPolicy::LargestRemaining,
            Utc::now(),
        )
        .is_none());
        assert!(select_candidate(
            &candidates,
            "claude-3",
            1,
            SelectionPolicy::LargestRemaining,
            Utc::now(),
        )
        .is_none());
    }

    #[test]
    fn skips_instances_outside_their_window() {
        let mut lapsed = instance(1, 500, 0, 3);
        lapsed.end_at = Utc::now() - Duration::seconds(1);
        let candidates = vec![lapsed, instance(2, 20, 0, 3)];
        let chosen = select_candidate(
            &candidates,
            "gpt-4",
            10,
            SelectionPolicy::LargestRemaining,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn parses_configured_policy_names() {
        assert_eq!(
            SelectionPolicy::parse(" Soonest_Expiry "),
            Some(SelectionPolicy::SoonestExpiry)
        );
        assert_eq!(SelectionPolicy::parse("random"), None);
    }
}

//! Negotiation context, campaign CPM tracking, and the persisted snapshot.

use crate::domain::{Campaign, InfluencerRow};
use crate::negotiation::state_machine::{NegotiationState, Transition};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Engagement at or above this fraction counts as "high" for flexibility.
const HIGH_ENGAGEMENT_RATE: f64 = 0.04;

/// CPM premium granted when the campaign is running under budget and the
/// influencer's engagement justifies it.
const FLEXIBILITY_PREMIUM_CPM: Decimal = dec!(2);

/// Per-thread negotiation context carried inside the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationContext {
    pub influencer: InfluencerRow,
    /// Subject of the email thread; replies reuse it for threading.
    pub subject: String,
    /// The rate we are currently anchored to.
    pub our_rate: Decimal,
    /// The influencer's most recent proposed rate, if they named one.
    pub their_last_rate: Option<Decimal>,
    /// Message id of the last message we saw on the thread.
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpmAgreement {
    pub cpm: Decimal,
    pub engagement_rate: Option<f64>,
}

/// Running CPM accounting for a campaign: every agreement lands here, and
/// the running average against the target band decides whether individual
/// negotiations get extra headroom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignCpmTracker {
    pub campaign_id: String,
    pub target_min_cpm: Decimal,
    pub target_max_cpm: Decimal,
    pub total_influencers: u32,
    pub agreements: Vec<CpmAgreement>,
}

impl CampaignCpmTracker {
    pub fn new(campaign: &Campaign) -> Self {
        Self {
            campaign_id: campaign.campaign_id.clone(),
            target_min_cpm: campaign.target_min_cpm,
            target_max_cpm: campaign.target_max_cpm,
            total_influencers: campaign.total_influencers,
            agreements: Vec::new(),
        }
    }

    pub fn record_agreement(&mut self, cpm: Decimal, engagement_rate: Option<f64>) {
        self.agreements.push(CpmAgreement {
            cpm,
            engagement_rate,
        });
    }

    /// Mean of agreed CPMs; `None` before the first agreement.
    pub fn running_average_cpm(&self) -> Option<Decimal> {
        if self.agreements.is_empty() {
            return None;
        }
        let sum: Decimal = self.agreements.iter().map(|a| a.cpm).sum();
        Some(sum / Decimal::from(self.agreements.len() as u64))
    }

    /// Influencers not yet agreed.
    pub fn remaining_capacity(&self) -> u32 {
        self.total_influencers
            .saturating_sub(self.agreements.len() as u32)
    }

    fn target_midpoint(&self) -> Decimal {
        (self.target_min_cpm + self.target_max_cpm) / dec!(2)
    }

    /// CPM premium for the current influencer. Granted only when agreements
    /// so far average strictly under the target midpoint and the influencer
    /// shows high engagement; zero otherwise.
    pub fn get_flexibility(&self, engagement_rate: Option<f64>) -> Decimal {
        let Some(average) = self.running_average_cpm() else {
            return Decimal::ZERO;
        };
        let high_engagement = engagement_rate
            .map(|rate| rate >= HIGH_ENGAGEMENT_RATE)
            .unwrap_or(false);
        if average < self.target_midpoint() && high_engagement {
            FLEXIBILITY_PREMIUM_CPM
        } else {
            Decimal::ZERO
        }
    }
}

/// The unit of persistence: everything needed to reconstruct a live
/// negotiation after a restart. Written on every state mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSnapshot {
    pub thread_id: String,
    pub state: NegotiationState,
    pub round_count: u32,
    pub context: NegotiationContext,
    pub campaign: Campaign,
    pub cpm_tracker: CampaignCpmTracker,
    pub history: Vec<Transition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegotiationSnapshot {
    /// A snapshot is active iff its state is non-terminal; startup recovery
    /// loads only active snapshots.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Deliverable, DeliverableType, Platform};

    fn campaign() -> Campaign {
        Campaign {
            campaign_id: "cmp-42".into(),
            name: "Spring Launch".into(),
            client_name: "Acme Beverages".into(),
            target_min_cpm: dec!(20),
            target_max_cpm: dec!(30),
            total_influencers: 10,
            deliverable: Deliverable::new(Platform::Instagram, DeliverableType::InstagramReel)
                .unwrap(),
            mention_users: vec!["U123".into()],
        }
    }

    #[test]
    fn running_average_over_agreements() {
        let mut tracker = CampaignCpmTracker::new(&campaign());
        assert_eq!(tracker.running_average_cpm(), None);
        tracker.record_agreement(dec!(20), None);
        tracker.record_agreement(dec!(24), Some(0.05));
        assert_eq!(tracker.running_average_cpm(), Some(dec!(22)));
        assert_eq!(tracker.remaining_capacity(), 8);
    }

    #[test]
    fn flexibility_requires_under_budget_and_high_engagement() {
        let mut tracker = CampaignCpmTracker::new(&campaign());
        // no agreements yet: no evidence of budget headroom
        assert_eq!(tracker.get_flexibility(Some(0.08)), Decimal::ZERO);

        tracker.record_agreement(dec!(21), None);
        // average 21 < midpoint 25, high engagement
        assert_eq!(tracker.get_flexibility(Some(0.05)), dec!(2));
        // low or unknown engagement gets nothing
        assert_eq!(tracker.get_flexibility(Some(0.01)), Decimal::ZERO);
        assert_eq!(tracker.get_flexibility(None), Decimal::ZERO);

        tracker.record_agreement(dec!(30), None);
        tracker.record_agreement(dec!(29), None);
        // average now at/above midpoint: no premium even with high engagement
        assert!(tracker.running_average_cpm().unwrap() >= dec!(25));
        assert_eq!(tracker.get_flexibility(Some(0.09)), Decimal::ZERO);
    }

    #[test]
    fn tracker_serde_round_trips_decimals_as_strings() {
        let mut tracker = CampaignCpmTracker::new(&campaign());
        tracker.record_agreement(dec!(24.50), Some(0.045));
        let json = serde_json::to_value(&tracker).unwrap();
        assert_eq!(json["target_min_cpm"], serde_json::json!("20"));
        assert_eq!(json["agreements"][0]["cpm"], serde_json::json!("24.50"));
        let back: CampaignCpmTracker = serde_json::from_value(json).unwrap();
        assert_eq!(back, tracker);
    }
}

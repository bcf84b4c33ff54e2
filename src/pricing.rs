//! CPM Pricing & Boundary Engine
//!
//! Pure, deterministic rate math. CPM is dollars per one thousand views:
//! `rate = (views / 1000) * cpm`, quantized to cents with round-half-up.
//! Every comparison against a floor/ceiling/threshold is strict, so a value
//! sitting exactly on a boundary is in range.
//!
//! Nothing in this module performs I/O or touches floating point.

use crate::domain::{format_money, quantize_cents, DeliverableType, PayRange};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where a proposed rate landed relative to the configured CPM band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryResult {
    WithinRange,
    ExceedsCeiling,
    BelowFloor,
    SuspiciouslyLow,
}

impl fmt::Display for BoundaryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WithinRange => "within_range",
            Self::ExceedsCeiling => "exceeds_ceiling",
            Self::BelowFloor => "below_floor",
            Self::SuspiciouslyLow => "suspiciously_low",
        };
        f.write_str(s)
    }
}

/// Which end of the rate card a computed rate anchors to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePreference {
    Floor,
    Ceiling,
    Midpoint,
}

/// Per-deliverable CPM thresholds, dollars per thousand views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCard {
    pub cpm_floor: Decimal,
    pub cpm_ceiling: Decimal,
    pub low_rate_threshold: Decimal,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            cpm_floor: dec!(20),
            cpm_ceiling: dec!(30),
            low_rate_threshold: dec!(15),
        }
    }
}

impl RateCard {
    pub fn new(cpm_floor: Decimal, cpm_ceiling: Decimal, low_rate_threshold: Decimal) -> Self {
        Self {
            cpm_floor,
            cpm_ceiling,
            low_rate_threshold,
        }
    }
}

/// One rate card per deliverable type. Deliverables without an explicit
/// entry fall back to the default card.
#[derive(Debug, Clone, Default)]
pub struct RateCardBook {
    overrides: HashMap<DeliverableType, RateCard>,
    fallback: RateCard,
}

impl RateCardBook {
    pub fn with_fallback(fallback: RateCard) -> Self {
        Self {
            overrides: HashMap::new(),
            fallback,
        }
    }

    pub fn set(&mut self, deliverable_type: DeliverableType, card: RateCard) {
        self.overrides.insert(deliverable_type, card);
    }

    pub fn card(&self, deliverable_type: DeliverableType) -> &RateCard {
        self.overrides.get(&deliverable_type).unwrap_or(&self.fallback)
    }
}

/// The authoritative verdict on a proposed rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub rate: Decimal,
    pub cpm: Decimal,
    pub boundary: BoundaryResult,
    pub should_escalate: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    NonPositiveViews(i64),
    InvertedBand {
        floor: Decimal,
        ceiling: Decimal,
    },
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveViews(v) => {
                write!(f, "cannot price against non-positive view count {v}")
            }
            Self::InvertedBand { floor, ceiling } => {
                write!(f, "CPM floor {floor} exceeds ceiling {ceiling}")
            }
        }
    }
}

impl std::error::Error for PricingError {}

fn views_in_thousands(views: i64) -> Result<Decimal, PricingError> {
    if views <= 0 {
        return Err(PricingError::NonPositiveViews(views));
    }
    Ok(Decimal::from(views) / dec!(1000))
}

/// `rate = (views / 1000) * cpm`, quantized to cents.
pub fn calculate_rate(views: i64, cpm: Decimal) -> Result<Decimal, PricingError> {
    Ok(quantize_cents(views_in_thousands(views)? * cpm))
}

/// The opening offer is always anchored at the floor.
pub fn calculate_initial_offer(views: i64, card: &RateCard) -> Result<Decimal, PricingError> {
    calculate_rate(views, card.cpm_floor)
}

/// Invert a rate back into the CPM it implies. Not quantized: callers
/// compare the exact value against thresholds.
pub fn calculate_cpm_from_rate(rate: Decimal, views: i64) -> Result<Decimal, PricingError> {
    Ok(rate / views_in_thousands(views)?)
}

/// The `[min_rate, max_rate]` band this view count earns across the card.
pub fn calculate_pay_range(views: i64, card: &RateCard) -> Result<PayRange, PricingError> {
    let min_rate = calculate_initial_offer(views, card)?;
    let max_rate = calculate_rate(views, card.cpm_ceiling)?;
    PayRange::new(min_rate, max_rate, views).map_err(|_| PricingError::InvertedBand {
        floor: card.cpm_floor,
        ceiling: card.cpm_ceiling,
    })
}

/// Rate for a deliverable at the chosen end of its card.
pub fn calculate_deliverable_rate(
    book: &RateCardBook,
    deliverable_type: DeliverableType,
    views: i64,
    preference: RatePreference,
) -> Result<Decimal, PricingError> {
    let card = book.card(deliverable_type);
    let cpm = match preference {
        RatePreference::Floor => card.cpm_floor,
        RatePreference::Ceiling => card.cpm_ceiling,
        RatePreference::Midpoint => (card.cpm_floor + card.cpm_ceiling) / dec!(2),
    };
    calculate_rate(views, cpm)
}

/// Classify a proposed rate against the card.
///
/// Ordering matters: the ceiling check runs first (it is the only one that
/// forces escalation), then the suspicious-low check, then the floor.
pub fn evaluate_proposed_rate(
    proposed_rate: Decimal,
    views: i64,
    card: &RateCard,
) -> Result<PricingResult, PricingError> {
    let implied_cpm = calculate_cpm_from_rate(proposed_rate, views)?;
    let shown_cpm = quantize_cents(implied_cpm);

    let (boundary, should_escalate, warning) = if implied_cpm > card.cpm_ceiling {
        (
            BoundaryResult::ExceedsCeiling,
            true,
            Some(format!(
                "proposed rate ${} implies ${} CPM, exceeds ${} ceiling",
                format_money(proposed_rate),
                format_money(shown_cpm),
                format_money(card.cpm_ceiling),
            )),
        )
    } else if implied_cpm < card.low_rate_threshold {
        (
            BoundaryResult::SuspiciouslyLow,
            false,
            Some(format!(
                "proposed rate ${} implies ${} CPM, under the ${} low-rate threshold; \
                 the influencer may have misunderstood the ask",
                format_money(proposed_rate),
                format_money(shown_cpm),
                format_money(card.low_rate_threshold),
            )),
        )
    } else if implied_cpm < card.cpm_floor {
        (BoundaryResult::BelowFloor, false, None)
    } else {
        (BoundaryResult::WithinRange, false, None)
    };

    Ok(PricingResult {
        rate: proposed_rate,
        cpm: shown_cpm,
        boundary,
        should_escalate,
        warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_views_over_thousand_times_cpm() {
        assert_eq!(calculate_rate(50_000, dec!(24)).unwrap(), dec!(1200.00));
        assert_eq!(calculate_rate(100_000, dec!(20)).unwrap(), dec!(2000.00));
        assert_eq!(calculate_rate(1_500, dec!(21.50)).unwrap(), dec!(32.25));
    }

    #[test]
    fn rate_rounds_half_up() {
        // 333 views at $20.15 CPM -> 6.70995 -> 6.71
        assert_eq!(calculate_rate(333, dec!(20.15)).unwrap(), dec!(6.71));
        // exact half-cent rounds away from zero
        assert_eq!(calculate_rate(250, dec!(20.02)).unwrap(), dec!(5.01));
    }

    #[test]
    fn non_positive_views_rejected() {
        assert_eq!(
            calculate_rate(0, dec!(20)).unwrap_err(),
            PricingError::NonPositiveViews(0)
        );
        assert!(calculate_cpm_from_rate(dec!(100), -5).is_err());
        assert!(evaluate_proposed_rate(dec!(100), 0, &RateCard::default()).is_err());
    }

    #[test]
    fn cpm_round_trips_exactly() {
        for (views, cpm) in [
            (50_000_i64, dec!(24)),
            (100_000, dec!(20)),
            (10_000, dec!(27.5)),
            (1_000, dec!(0)),
        ] {
            let rate = calculate_rate(views, cpm).unwrap();
            assert_eq!(calculate_cpm_from_rate(rate, views).unwrap(), cpm);
        }
    }

    #[test]
    fn initial_offer_is_floor_anchored() {
        let card = RateCard::default();
        assert_eq!(calculate_initial_offer(100_000, &card).unwrap(), dec!(2000.00));
    }

    #[test]
    fn pay_range_spans_floor_to_ceiling() {
        let range = calculate_pay_range(100_000, &RateCard::default()).unwrap();
        assert_eq!(range.min_rate, dec!(2000.00));
        assert_eq!(range.max_rate, dec!(3000.00));
        assert_eq!(range.average_views, 100_000);

        let inverted = RateCard::new(dec!(30), dec!(20), dec!(15));
        assert!(matches!(
            calculate_pay_range(100_000, &inverted),
            Err(PricingError::InvertedBand { .. })
        ));
    }

    #[test]
    fn deliverable_rate_honors_preference() {
        let book = RateCardBook::default();
        let dt = DeliverableType::InstagramReel;
        assert_eq!(
            calculate_deliverable_rate(&book, dt, 100_000, RatePreference::Floor).unwrap(),
            dec!(2000.00)
        );
        assert_eq!(
            calculate_deliverable_rate(&book, dt, 100_000, RatePreference::Ceiling).unwrap(),
            dec!(3000.00)
        );
        assert_eq!(
            calculate_deliverable_rate(&book, dt, 100_000, RatePreference::Midpoint).unwrap(),
            dec!(2500.00)
        );
    }

    #[test]
    fn deliverable_rate_uses_override_card() {
        let mut book = RateCardBook::default();
        book.set(
            DeliverableType::YoutubeDedicated,
            RateCard::new(dec!(40), dec!(60), dec!(25)),
        );
        assert_eq!(
            calculate_deliverable_rate(
                &book,
                DeliverableType::YoutubeDedicated,
                10_000,
                RatePreference::Floor
            )
            .unwrap(),
            dec!(400.00)
        );
        // other deliverables still fall back to the default card
        assert_eq!(
            calculate_deliverable_rate(
                &book,
                DeliverableType::TiktokVideo,
                10_000,
                RatePreference::Floor
            )
            .unwrap(),
            dec!(200.00)
        );
    }

    #[test]
    fn over_ceiling_escalates_with_named_excess() {
        // $1,800 over 50k views implies $36 CPM
        let result = evaluate_proposed_rate(dec!(1800), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::ExceedsCeiling);
        assert!(result.should_escalate);
        let warning = result.warning.unwrap();
        assert!(warning.contains("36.00"));
        assert!(warning.contains("exceeds $30.00 ceiling"));
    }

    #[test]
    fn exactly_at_ceiling_is_within_range() {
        // $1,500 over 50k views implies exactly $30 CPM
        let result = evaluate_proposed_rate(dec!(1500), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::WithinRange);
        assert!(!result.should_escalate);
        assert!(result.warning.is_none());
    }

    #[test]
    fn one_cent_past_ceiling_fires() {
        let result = evaluate_proposed_rate(dec!(1500.01), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::ExceedsCeiling);
        assert!(result.should_escalate);
    }

    #[test]
    fn exactly_at_floor_is_within_range() {
        // $1,000 over 50k views implies exactly $20 CPM
        let result = evaluate_proposed_rate(dec!(1000), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::WithinRange);
    }

    #[test]
    fn between_low_threshold_and_floor_is_below_floor() {
        // $900 over 50k views implies $18 CPM: above $15, below $20
        let result = evaluate_proposed_rate(dec!(900), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::BelowFloor);
        assert!(!result.should_escalate);
        assert!(result.warning.is_none());
    }

    #[test]
    fn suspiciously_low_warns_without_escalating() {
        // $500 over 50k views implies $10 CPM
        let result = evaluate_proposed_rate(dec!(500), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::SuspiciouslyLow);
        assert!(!result.should_escalate);
        assert!(result.warning.unwrap().contains("misunderstood"));
    }

    #[test]
    fn exactly_at_low_threshold_is_below_floor_not_suspicious() {
        // $750 over 50k views implies exactly $15 CPM
        let result = evaluate_proposed_rate(dec!(750), 50_000, &RateCard::default()).unwrap();
        assert_eq!(result.boundary, BoundaryResult::BelowFloor);
    }
}

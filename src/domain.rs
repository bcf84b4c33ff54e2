//! Core domain model: platforms, deliverables, campaigns, influencer rows.
//!
//! Monetary values are `rust_decimal::Decimal` end to end. Floats from
//! external sources (spreadsheet, LLM output) are coerced through their
//! string rendering so the displayed precision survives; `engagement_rate`
//! is the one metric that stays a float (it is a percentage, not money).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Social platform an influencer publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    Youtube,
}

impl Platform {
    /// Deliverable types that belong to this platform. Authoritative
    /// mapping; `Deliverable::new` validates against it.
    pub fn deliverables(&self) -> &'static [DeliverableType] {
        match self {
            Platform::Instagram => &[
                DeliverableType::InstagramPost,
                DeliverableType::InstagramStory,
                DeliverableType::InstagramReel,
            ],
            Platform::Tiktok => &[
                DeliverableType::TiktokVideo,
                DeliverableType::TiktokStory,
            ],
            Platform::Youtube => &[
                DeliverableType::YoutubeDedicated,
                DeliverableType::YoutubeIntegration,
                DeliverableType::YoutubeShort,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Youtube => "youtube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "youtube" => Ok(Platform::Youtube),
            other => Err(DomainError::UnknownPlatform(other.to_string())),
        }
    }
}

/// A concrete piece of influencer content, scoped to exactly one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableType {
    InstagramPost,
    InstagramStory,
    InstagramReel,
    TiktokVideo,
    TiktokStory,
    YoutubeDedicated,
    YoutubeIntegration,
    YoutubeShort,
}

impl DeliverableType {
    pub fn platform(&self) -> Platform {
        match self {
            DeliverableType::InstagramPost
            | DeliverableType::InstagramStory
            | DeliverableType::InstagramReel => Platform::Instagram,
            DeliverableType::TiktokVideo | DeliverableType::TiktokStory => Platform::Tiktok,
            DeliverableType::YoutubeDedicated
            | DeliverableType::YoutubeIntegration
            | DeliverableType::YoutubeShort => Platform::Youtube,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverableType::InstagramPost => "instagram_post",
            DeliverableType::InstagramStory => "instagram_story",
            DeliverableType::InstagramReel => "instagram_reel",
            DeliverableType::TiktokVideo => "tiktok_video",
            DeliverableType::TiktokStory => "tiktok_story",
            DeliverableType::YoutubeDedicated => "youtube_dedicated",
            DeliverableType::YoutubeIntegration => "youtube_integration",
            DeliverableType::YoutubeShort => "youtube_short",
        }
    }

    /// Human wording used in outbound emails ("Instagram reel", "dedicated
    /// YouTube video"). The validation gate checks these terms are present.
    pub fn display_term(&self) -> &'static str {
        match self {
            DeliverableType::InstagramPost => "Instagram post",
            DeliverableType::InstagramStory => "Instagram story",
            DeliverableType::InstagramReel => "Instagram reel",
            DeliverableType::TiktokVideo => "TikTok video",
            DeliverableType::TiktokStory => "TikTok story",
            DeliverableType::YoutubeDedicated => "dedicated YouTube video",
            DeliverableType::YoutubeIntegration => "YouTube integration",
            DeliverableType::YoutubeShort => "YouTube Short",
        }
    }
}

impl fmt::Display for DeliverableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deliverable bound to its platform. Construction validates the pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub platform: Platform,
    pub deliverable_type: DeliverableType,
}

impl Deliverable {
    pub fn new(platform: Platform, deliverable_type: DeliverableType) -> Result<Self, DomainError> {
        if deliverable_type.platform() != platform {
            return Err(DomainError::DeliverableMismatch {
                platform,
                deliverable_type,
            });
        }
        Ok(Self {
            platform,
            deliverable_type,
        })
    }
}

/// Pre-computed `[min_rate, max_rate]` band for a given average-view count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRange {
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    pub average_views: i64,
}

impl PayRange {
    pub fn new(min_rate: Decimal, max_rate: Decimal, average_views: i64) -> Result<Self, DomainError> {
        if average_views <= 0 {
            return Err(DomainError::NonPositiveViews(average_views));
        }
        if min_rate > max_rate {
            return Err(DomainError::InvertedRange { min_rate, max_rate });
        }
        Ok(Self {
            min_rate,
            max_rate,
            average_views,
        })
    }
}

/// One influencer as read from the spreadsheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluencerRow {
    pub name: String,
    pub email: String,
    pub platform: Platform,
    pub handle: String,
    pub average_views: i64,
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    /// Fractional percentage (e.g. 0.045 for 4.5%). Metric, not money.
    pub engagement_rate: Option<f64>,
}

/// An active campaign a negotiation belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: String,
    pub name: String,
    pub client_name: String,
    pub target_min_cpm: Decimal,
    pub target_max_cpm: Decimal,
    pub total_influencers: u32,
    pub deliverable: Deliverable,
    /// Slack user ids to @-mention on agreement.
    pub mention_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainError {
    UnknownPlatform(String),
    DeliverableMismatch {
        platform: Platform,
        deliverable_type: DeliverableType,
    },
    NonPositiveViews(i64),
    InvertedRange {
        min_rate: Decimal,
        max_rate: Decimal,
    },
    BadMoney(String),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPlatform(s) => write!(f, "unknown platform: {s}"),
            Self::DeliverableMismatch {
                platform,
                deliverable_type,
            } => write!(
                f,
                "deliverable {deliverable_type} does not belong to platform {platform}"
            ),
            Self::NonPositiveViews(v) => write!(f, "average_views must be positive, got {v}"),
            Self::InvertedRange { min_rate, max_rate } => {
                write!(f, "min_rate {min_rate} exceeds max_rate {max_rate}")
            }
            Self::BadMoney(s) => write!(f, "cannot parse monetary value: {s:?}"),
        }
    }
}

impl std::error::Error for DomainError {}

/// Quantize to cents, round half up.
pub fn quantize_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Coerce an external float to money via its string rendering, preserving
/// the precision the source displayed.
pub fn money_from_f64(value: f64) -> Result<Decimal, DomainError> {
    if !value.is_finite() {
        return Err(DomainError::BadMoney(value.to_string()));
    }
    Decimal::from_str(&value.to_string()).map_err(|_| DomainError::BadMoney(value.to_string()))
}

/// Parse a monetary string as it appears in emails and spreadsheets:
/// optional `$`, optional thousands separators, optional cents.
pub fn parse_money(raw: &str) -> Result<Decimal, DomainError> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return Err(DomainError::BadMoney(raw.to_string()));
    }
    Decimal::from_str(&cleaned).map_err(|_| DomainError::BadMoney(raw.to_string()))
}

/// Render money the way outbound emails and Slack messages show it:
/// two decimal places, thousands separators.
pub fn format_money(value: Decimal) -> String {
    let cents = quantize_cents(value);
    let s = format!("{cents:.2}");
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part),
    };
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{sign}{grouped}.{frac_part}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn deliverable_platform_mapping_is_total() {
        for platform in [Platform::Instagram, Platform::Tiktok, Platform::Youtube] {
            for dt in platform.deliverables() {
                assert_eq!(dt.platform(), platform);
                assert!(Deliverable::new(platform, *dt).is_ok());
            }
        }
    }

    #[test]
    fn deliverable_rejects_cross_platform() {
        let err = Deliverable::new(Platform::Instagram, DeliverableType::TiktokVideo).unwrap_err();
        assert!(matches!(err, DomainError::DeliverableMismatch { .. }));
    }

    #[test]
    fn pay_range_invariants() {
        assert!(PayRange::new(dec!(100), dec!(200), 10_000).is_ok());
        assert!(PayRange::new(dec!(200), dec!(100), 10_000).is_err());
        assert!(PayRange::new(dec!(100), dec!(200), 0).is_err());
    }

    #[test]
    fn money_from_f64_preserves_displayed_precision() {
        assert_eq!(money_from_f64(1200.5).unwrap(), dec!(1200.5));
        assert_eq!(money_from_f64(0.1).unwrap(), dec!(0.1));
        assert!(money_from_f64(f64::NAN).is_err());
    }

    #[test]
    fn parse_money_accepts_common_forms() {
        assert_eq!(parse_money("$1,200").unwrap(), dec!(1200));
        assert_eq!(parse_money("$2,500.00").unwrap(), dec!(2500.00));
        assert_eq!(parse_money("36").unwrap(), dec!(36));
        assert!(parse_money("$").is_err());
        assert!(parse_money("one hundred").is_err());
    }

    #[test]
    fn quantize_rounds_half_up() {
        assert_eq!(quantize_cents(dec!(1.005)), dec!(1.01));
        assert_eq!(quantize_cents(dec!(1.004)), dec!(1.00));
        assert_eq!(quantize_cents(dec!(2.675)), dec!(2.68));
    }

    #[test]
    fn format_money_groups_thousands() {
        assert_eq!(format_money(dec!(1200)), "1,200.00");
        assert_eq!(format_money(dec!(24)), "24.00");
        assert_eq!(format_money(dec!(1234567.891)), "1,234,567.89");
    }

    #[test]
    fn enum_serde_uses_textual_names() {
        assert_eq!(
            serde_json::to_string(&DeliverableType::YoutubeDedicated).unwrap(),
            "\"youtube_dedicated\""
        );
        assert_eq!(serde_json::to_string(&Platform::Tiktok).unwrap(), "\"tiktok\"");
        let p: Platform = serde_json::from_str("\"instagram\"").unwrap();
        assert_eq!(p, Platform::Instagram);
    }
}

//! Escalation trigger engine.
//!
//! Two deterministic triggers (CPM over ceiling, low intent confidence) run
//! first; the three semantic triggers (hostile tone, legal language,
//! unusual deliverables) share a single LLM call that only happens when at
//! least one of them is enabled, a classifier is configured, and nothing
//! deterministic already fired. Threshold comparisons are strict: a value
//! sitting exactly on a threshold does not fire.
//!
//! Config comes from an operator-editable TOML file. A missing, empty, or
//! malformed file falls back to all-defaults with every trigger enabled.

use crate::domain::format_money;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    CpmOverThreshold,
    AmbiguousIntent,
    HostileTone,
    LegalLanguage,
    UnusualDeliverables,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::CpmOverThreshold => "cpm_over_threshold",
            TriggerType::AmbiguousIntent => "ambiguous_intent",
            TriggerType::HostileTone => "hostile_tone",
            TriggerType::LegalLanguage => "legal_language",
            TriggerType::UnusualDeliverables => "unusual_deliverables",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpmTriggerConfig {
    pub enabled: bool,
    /// Dollars per thousand views; written as a string in the TOML file so
    /// it never passes through a float.
    pub ceiling: Decimal,
}

impl Default for CpmTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ceiling: dec!(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbiguousIntentConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
}

impl Default for AmbiguousIntentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.70,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticTriggerConfig {
    pub enabled: bool,
}

impl Default for SemanticTriggerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerEngineConfig {
    pub cpm_over_threshold: CpmTriggerConfig,
    pub ambiguous_intent: AmbiguousIntentConfig,
    pub hostile_tone: SemanticTriggerConfig,
    pub legal_language: SemanticTriggerConfig,
    pub unusual_deliverables: SemanticTriggerConfig,
}

impl TriggerEngineConfig {
    /// Load from the operator-editable file. Any problem (absent file,
    /// unreadable, bad TOML) logs a warning and falls back to defaults
    /// with every trigger enabled; the negotiation loop never stalls on a
    /// config typo.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "trigger config unreadable, using defaults");
                return Self::default();
            }
        };
        if raw.trim().is_empty() {
            warn!(path = %path.display(), "trigger config empty, using defaults");
            return Self::default();
        }
        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "trigger config malformed, using defaults");
                Self::default()
            }
        }
    }

    fn any_semantic_enabled(&self) -> bool {
        self.hostile_tone.enabled || self.legal_language.enabled || self.unusual_deliverables.enabled
    }
}

/// One semantic flag in the shared LLM verdict. A flag without quoted
/// evidence is not actionable and does not fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticFlag {
    #[serde(default)]
    pub fired: bool,
    #[serde(default)]
    pub evidence: String,
}

/// Fixed output schema of the single semantic-trigger LLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticTriggerVerdict {
    #[serde(default)]
    pub hostile_tone: SemanticFlag,
    #[serde(default)]
    pub legal_language: SemanticFlag,
    #[serde(default)]
    pub unusual_deliverables: SemanticFlag,
}

/// The seam the LLM layer implements; tests inject scripted verdicts.
#[async_trait]
pub trait SemanticTriggerClassifier: Send + Sync {
    async fn classify(&self, email_body: &str) -> anyhow::Result<SemanticTriggerVerdict>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub trigger_type: TriggerType,
    pub fired: bool,
    pub reason: Option<String>,
    pub evidence: Option<String>,
}

impl TriggerResult {
    fn quiet(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            fired: false,
            reason: None,
            evidence: None,
        }
    }
}

pub struct TriggerEngine {
    config: TriggerEngineConfig,
    classifier: Option<Arc<dyn SemanticTriggerClassifier>>,
}

impl TriggerEngine {
    pub fn new(
        config: TriggerEngineConfig,
        classifier: Option<Arc<dyn SemanticTriggerClassifier>>,
    ) -> Self {
        Self { config, classifier }
    }

    pub fn config(&self) -> &TriggerEngineConfig {
        &self.config
    }

    /// Evaluate all five triggers for an inbound email.
    ///
    /// `intent_confidence` of exactly 0.0 is the pre-classification
    /// sentinel: the reply has not been through the intent classifier yet,
    /// so the ambiguous-intent trigger stays quiet (a genuinely
    /// low-confidence classification is overridden to ambiguous by the
    /// orchestrator after classification regardless).
    ///
    /// A semantic-classifier failure propagates; the caller surfaces it
    /// without advancing the negotiation.
    pub async fn evaluate(
        &self,
        email_body: &str,
        proposed_cpm: Decimal,
        intent_confidence: f64,
    ) -> anyhow::Result<Vec<TriggerResult>> {
        let mut results = Vec::with_capacity(5);

        let cpm = &self.config.cpm_over_threshold;
        if cpm.enabled && proposed_cpm > cpm.ceiling {
            results.push(TriggerResult {
                trigger_type: TriggerType::CpmOverThreshold,
                fired: true,
                reason: Some(format!(
                    "proposed CPM ${} exceeds ${} ceiling",
                    format_money(proposed_cpm),
                    format_money(cpm.ceiling)
                )),
                evidence: None,
            });
        } else {
            results.push(TriggerResult::quiet(TriggerType::CpmOverThreshold));
        }

        let ambiguous = &self.config.ambiguous_intent;
        if ambiguous.enabled
            && intent_confidence > 0.0
            && intent_confidence < ambiguous.confidence_threshold
        {
            results.push(TriggerResult {
                trigger_type: TriggerType::AmbiguousIntent,
                fired: true,
                reason: Some(format!(
                    "intent confidence {:.2} under {:.2} threshold",
                    intent_confidence, ambiguous.confidence_threshold
                )),
                evidence: None,
            });
        } else {
            results.push(TriggerResult::quiet(TriggerType::AmbiguousIntent));
        }

        let deterministic_fired = results.iter().any(|r| r.fired);

        let verdict = match &self.classifier {
            Some(classifier) if !deterministic_fired && self.config.any_semantic_enabled() => {
                Some(classifier.classify(email_body).await?)
            }
            _ => {
                debug!(
                    deterministic_fired,
                    semantic_enabled = self.config.any_semantic_enabled(),
                    has_classifier = self.classifier.is_some(),
                    "semantic trigger call skipped"
                );
                None
            }
        };

        results.push(semantic_result(
            TriggerType::HostileTone,
            self.config.hostile_tone.enabled,
            verdict.as_ref().map(|v| &v.hostile_tone),
            "hostile or threatening tone",
        ));
        results.push(semantic_result(
            TriggerType::LegalLanguage,
            self.config.legal_language.enabled,
            verdict.as_ref().map(|v| &v.legal_language),
            "contract or legal language",
        ));
        results.push(semantic_result(
            TriggerType::UnusualDeliverables,
            self.config.unusual_deliverables.enabled,
            verdict.as_ref().map(|v| &v.unusual_deliverables),
            "deliverable request outside the defined set",
        ));

        Ok(results)
    }
}

fn semantic_result(
    trigger_type: TriggerType,
    enabled: bool,
    flag: Option<&SemanticFlag>,
    label: &str,
) -> TriggerResult {
    let Some(flag) = flag else {
        return TriggerResult::quiet(trigger_type);
    };
    if enabled && flag.fired && !flag.evidence.trim().is_empty() {
        TriggerResult {
            trigger_type,
            fired: true,
            reason: Some(format!("model flagged {label}")),
            evidence: Some(flag.evidence.clone()),
        }
    } else {
        TriggerResult::quiet(trigger_type)
    }
}

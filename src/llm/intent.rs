//! Intent classification of influencer replies.
//!
//! One call, one fixed schema. The model labels the reply and may extract
//! a proposed rate; the orchestrator owns the confidence override (a label
//! under the configured threshold is treated as ambiguous no matter what
//! the model said).

use crate::domain::parse_money;
use crate::llm::{extract_json_object, OpenRouterClient};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Accept,
    Counter,
    Reject,
    Ambiguous,
    HostileTone,
    LegalLanguage,
    UnusualDeliverables,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Accept => "accept",
            IntentLabel::Counter => "counter",
            IntentLabel::Reject => "reject",
            IntentLabel::Ambiguous => "ambiguous",
            IntentLabel::HostileTone => "hostile_tone",
            IntentLabel::LegalLanguage => "legal_language",
            IntentLabel::UnusualDeliverables => "unusual_deliverables",
        }
    }
}

impl fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(IntentLabel::Accept),
            "counter" => Ok(IntentLabel::Counter),
            "reject" => Ok(IntentLabel::Reject),
            "ambiguous" => Ok(IntentLabel::Ambiguous),
            "hostile_tone" => Ok(IntentLabel::HostileTone),
            "legal_language" => Ok(IntentLabel::LegalLanguage),
            "unusual_deliverables" => Ok(IntentLabel::UnusualDeliverables),
            other => Err(anyhow!("unknown intent label: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentClassification {
    pub intent: IntentLabel,
    pub confidence: f64,
    pub proposed_rate: Option<Decimal>,
    pub evidence_quote: Option<String>,
}

/// What the classifier needs to read a reply in context.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub email_body: String,
    pub influencer_name: String,
    pub our_rate: Decimal,
    pub deliverable_term: String,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, request: &IntentRequest) -> Result<IntentClassification>;
}

/// Stand-in when no LLM key is configured. Classification is a hard
/// requirement for the pipeline, so this fails the call rather than
/// guessing; the pipeline surfaces the error without advancing state.
pub struct DisabledIntentClassifier;

#[async_trait]
impl IntentClassifier for DisabledIntentClassifier {
    async fn classify(&self, _request: &IntentRequest) -> Result<IntentClassification> {
        Err(anyhow!("intent classification disabled (no LLM credentials)"))
    }
}

const SYSTEM_PROMPT: &str = "You classify influencer replies in a rate negotiation. \
Respond with a single JSON object and nothing else: \
{\"intent\": one of accept|counter|reject|ambiguous|hostile_tone|legal_language|unusual_deliverables, \
\"confidence\": number between 0 and 1, \
\"proposed_rate\": dollar amount the influencer asks for as a string, or null, \
\"evidence_quote\": short quote from the reply supporting the label, or null}. \
Classify accept only when the reply clearly agrees to our current rate. \
Classify counter when a different rate is requested or implied.";

pub struct LlmIntentClassifier {
    client: OpenRouterClient,
    model: String,
    timeout: Duration,
}

impl LlmIntentClassifier {
    pub fn new(client: OpenRouterClient, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, request: &IntentRequest) -> Result<IntentClassification> {
        let user = format!(
            "Our current offer to {name} is ${rate} for one {deliverable}.\n\
             Their reply:\n---\n{body}\n---",
            name = request.influencer_name,
            rate = request.our_rate,
            deliverable = request.deliverable_term,
            body = request.email_body,
        );
        let output = self
            .client
            .chat_completion(&self.model, SYSTEM_PROMPT, &user, 300, 0.0, self.timeout)
            .await
            .context("intent classification call")?;
        let classification = parse_intent_response(&output.content)?;
        debug!(
            intent = %classification.intent,
            confidence = classification.confidence,
            latency_ms = output.latency_ms,
            "intent classified"
        );
        Ok(classification)
    }
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    intent: String,
    confidence: f64,
    #[serde(default)]
    proposed_rate: Option<serde_json::Value>,
    #[serde(default)]
    evidence_quote: Option<String>,
}

/// Parse the model's JSON into the domain type. Rates arrive as strings or
/// JSON numbers; both are coerced through their string rendering so no
/// float ever becomes money.
pub fn parse_intent_response(raw: &str) -> Result<IntentClassification> {
    let json = extract_json_object(raw)?;
    let parsed: RawIntent = serde_json::from_str(json).context("intent schema")?;

    let intent = IntentLabel::from_str(&parsed.intent)?;
    let confidence = if parsed.confidence.is_finite() {
        parsed.confidence.clamp(0.0, 1.0)
    } else {
        return Err(anyhow!("non-finite confidence"));
    };

    let proposed_rate = match parsed.proposed_rate {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(parse_money(&s)?),
        Some(serde_json::Value::Number(n)) => Some(parse_money(&n.to_string())?),
        Some(other) => return Err(anyhow!("unexpected proposed_rate: {other}")),
    };

    let evidence_quote = parsed.evidence_quote.filter(|q| !q.trim().is_empty());

    Ok(IntentClassification {
        intent,
        confidence,
        proposed_rate,
        evidence_quote,
    })
}

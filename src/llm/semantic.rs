//! The shared semantic-trigger screening call.
//!
//! One request covers all three semantic triggers; the trigger engine
//! decides which of the returned flags are actionable based on its config.

use crate::llm::{extract_json_object, OpenRouterClient};
use crate::negotiation::triggers::{SemanticTriggerClassifier, SemanticTriggerVerdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You screen inbound influencer emails for escalation signals. \
Respond with a single JSON object and nothing else: \
{\"hostile_tone\": {\"fired\": bool, \"evidence\": string}, \
\"legal_language\": {\"fired\": bool, \"evidence\": string}, \
\"unusual_deliverables\": {\"fired\": bool, \"evidence\": string}}. \
hostile_tone: hostile, threatening, or condescending language. \
legal_language: references to contracts, lawyers, or legal action. \
unusual_deliverables: requests outside standard posts, stories, reels, videos, \
dedications, integrations, or shorts. \
When a flag is true, evidence must be a short verbatim quote from the email; \
otherwise use an empty string.";

pub struct LlmSemanticClassifier {
    client: OpenRouterClient,
    model: String,
    timeout: Duration,
}

impl LlmSemanticClassifier {
    pub fn new(client: OpenRouterClient, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl SemanticTriggerClassifier for LlmSemanticClassifier {
    async fn classify(&self, email_body: &str) -> Result<SemanticTriggerVerdict> {
        let user = format!("Email:\n---\n{email_body}\n---");
        let output = self
            .client
            .chat_completion(&self.model, SYSTEM_PROMPT, &user, 400, 0.0, self.timeout)
            .await
            .context("semantic trigger call")?;
        let json = extract_json_object(&output.content)?;
        let verdict: SemanticTriggerVerdict =
            serde_json::from_str(json).context("semantic trigger schema")?;
        debug!(latency_ms = output.latency_ms, "semantic triggers screened");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use crate::llm::extract_json_object;
    use crate::negotiation::triggers::SemanticTriggerVerdict;

    #[test]
    fn verdict_schema_parses_partial_objects() {
        let raw = r#"{"hostile_tone": {"fired": true, "evidence": "pay up or else"}}"#;
        let verdict: SemanticTriggerVerdict =
            serde_json::from_str(extract_json_object(raw).unwrap()).unwrap();
        assert!(verdict.hostile_tone.fired);
        assert_eq!(verdict.hostile_tone.evidence, "pay up or else");
        assert!(!verdict.legal_language.fired);
        assert!(!verdict.unusual_deliverables.fired);
    }
}

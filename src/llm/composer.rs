//! Counter-offer composition.
//!
//! Only called once the pipeline has decided to send a counter; the draft
//! always goes through the deterministic validation gate before transport.
//! Temperature 0 keeps re-runs of the same negotiation step reproducible.

use crate::domain::format_money;
use crate::llm::{extract_json_object, OpenRouterClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub influencer_name: String,
    pub client_name: String,
    pub deliverable_term: String,
    /// The authoritative rate from the pricing engine. The draft must name
    /// this figure and no other.
    pub our_rate: Decimal,
    pub their_rate: Option<Decimal>,
    pub subject: String,
    pub round_count: u32,
    /// Negotiation playbook guidance passed through from config.
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedEmail {
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailComposer: Send + Sync {
    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedEmail>;
}

/// Stand-in when no LLM key is configured; composing fails and the
/// pipeline surfaces the error instead of sending anything.
pub struct DisabledEmailComposer;

#[async_trait]
impl EmailComposer for DisabledEmailComposer {
    async fn compose(&self, _request: &ComposeRequest) -> Result<ComposedEmail> {
        Err(anyhow::anyhow!("composer disabled (no LLM credentials)"))
    }
}

const SYSTEM_PROMPT: &str = "You draft concise, warm counter-offer emails for an influencer \
marketing team. Respond with a single JSON object and nothing else: \
{\"subject\": string, \"body\": string}. The body must name the offered rate exactly once, \
formatted like $1,234.56, and must not name any other dollar amount. Mention the deliverable. \
Do not invent terms, deadlines, or usage rights that were not provided.";

pub struct LlmEmailComposer {
    client: OpenRouterClient,
    model: String,
    timeout: Duration,
}

impl LlmEmailComposer {
    pub fn new(client: OpenRouterClient, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl EmailComposer for LlmEmailComposer {
    async fn compose(&self, request: &ComposeRequest) -> Result<ComposedEmail> {
        let their_rate = request
            .their_rate
            .map(|r| format!("${}", format_money(r)))
            .unwrap_or_else(|| "none stated".to_string());
        let user = format!(
            "Influencer: {name}\nClient: {client}\nDeliverable: {deliverable}\n\
             Our rate to offer: ${rate}\nTheir last ask: {their_rate}\n\
             Negotiation round: {round}\nReply subject: {subject}\n\
             Guidance: {guidance}",
            name = request.influencer_name,
            client = request.client_name,
            deliverable = request.deliverable_term,
            rate = format_money(request.our_rate),
            round = request.round_count,
            subject = request.subject,
            guidance = request.guidance.as_deref().unwrap_or("keep it friendly and brief"),
        );
        let output = self
            .client
            .chat_completion(&self.model, SYSTEM_PROMPT, &user, 600, 0.0, self.timeout)
            .await
            .context("composer call")?;
        let draft = parse_composer_response(&output.content)?;
        debug!(latency_ms = output.latency_ms, "counter-offer drafted");
        Ok(draft)
    }
}

#[derive(Debug, Deserialize)]
struct RawDraft {
    #[serde(default)]
    subject: String,
    body: String,
}

pub fn parse_composer_response(raw: &str) -> Result<ComposedEmail> {
    let json = extract_json_object(raw)?;
    let parsed: RawDraft = serde_json::from_str(json).context("composer schema")?;
    Ok(ComposedEmail {
        subject: parsed.subject,
        body: parsed.body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_draft() {
        let draft = parse_composer_response(
            r#"{"subject": "Re: Partnership", "body": "We can offer $2,000.00 for one Instagram reel."}"#,
        )
        .unwrap();
        assert_eq!(draft.subject, "Re: Partnership");
        assert!(draft.body.contains("$2,000.00"));
    }

    #[test]
    fn missing_body_is_an_error() {
        assert!(parse_composer_response(r#"{"subject": "Re: hi"}"#).is_err());
    }
}

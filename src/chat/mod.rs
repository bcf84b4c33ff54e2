//! Chat-platform notifications: escalations and deal agreements.
//!
//! The core hands structured payloads to a [`ChatNotifier`]; the Slack
//! implementation renders them as Block Kit messages with a plain-text
//! fallback. Deployments without chat credentials get the no-op notifier,
//! so the negotiation loop degrades gracefully instead of failing sends.

pub mod commands;

use crate::domain::{format_money, Platform};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a human needs to pick up an escalated negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub influencer_name: String,
    pub influencer_email: String,
    pub client_name: String,
    pub escalation_reason: String,
    pub evidence_quote: Option<String>,
    pub proposed_rate: Option<Decimal>,
    pub our_rate: Option<Decimal>,
    pub suggested_actions: Vec<String>,
    pub details_link: String,
}

/// Posted when a negotiation lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementPayload {
    pub influencer_name: String,
    pub influencer_email: String,
    pub client_name: String,
    pub agreed_rate: Decimal,
    pub platform: Platform,
    pub deliverables: String,
    pub cpm_achieved: Decimal,
    pub thread_id: String,
    pub next_steps: Vec<String>,
    pub mention_users: Vec<String>,
}

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    /// Returns the platform message timestamp when one exists.
    async fn post_escalation(&self, payload: &EscalationPayload) -> Result<Option<String>>;
    async fn post_agreement(&self, payload: &AgreementPayload) -> Result<Option<String>>;
    /// Plain-text operational notices (e.g. influencers missing from the
    /// sheet during campaign ingest).
    async fn post_message(&self, text: &str) -> Result<Option<String>>;
}

/// Used when no chat credentials are configured.
pub struct NoopChatNotifier;

#[async_trait]
impl ChatNotifier for NoopChatNotifier {
    async fn post_escalation(&self, payload: &EscalationPayload) -> Result<Option<String>> {
        debug!(
            influencer = %payload.influencer_name,
            reason = %payload.escalation_reason,
            "chat disabled; escalation not posted"
        );
        Ok(None)
    }

    async fn post_agreement(&self, payload: &AgreementPayload) -> Result<Option<String>> {
        debug!(
            influencer = %payload.influencer_name,
            "chat disabled; agreement not posted"
        );
        Ok(None)
    }

    async fn post_message(&self, _text: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

const SLACK_API_BASE: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SlackNotifier {
    http: reqwest::Client,
    bot_token: String,
    channel: String,
}

impl SlackNotifier {
    pub fn new(http: reqwest::Client, bot_token: String, channel: String) -> Self {
        Self {
            http,
            bot_token,
            channel,
        }
    }

    async fn post_blocks(
        &self,
        blocks: serde_json::Value,
        fallback_text: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .http
            .post(format!("{SLACK_API_BASE}/chat.postMessage"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.bot_token)
            .json(&json!({
                "channel": self.channel,
                "text": fallback_text,
                "blocks": blocks,
            }))
            .send()
            .await
            .context("slack chat.postMessage")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("slack {}: {snippet}", status.as_u16()));
        }
        let parsed: SlackPostResponse = serde_json::from_str(&body).context("slack json parse")?;
        if !parsed.ok {
            return Err(anyhow!(
                "slack error: {}",
                parsed.error.unwrap_or_else(|| "unknown".into())
            ));
        }
        Ok(parsed.ts)
    }
}

#[async_trait]
impl ChatNotifier for SlackNotifier {
    async fn post_escalation(&self, payload: &EscalationPayload) -> Result<Option<String>> {
        let ts = self
            .post_blocks(escalation_blocks(payload), &escalation_fallback(payload))
            .await?;
        info!(influencer = %payload.influencer_name, "escalation posted to chat");
        Ok(ts)
    }

    async fn post_agreement(&self, payload: &AgreementPayload) -> Result<Option<String>> {
        let ts = self
            .post_blocks(agreement_blocks(payload), &agreement_fallback(payload))
            .await?;
        info!(influencer = %payload.influencer_name, "agreement posted to chat");
        Ok(ts)
    }

    async fn post_message(&self, text: &str) -> Result<Option<String>> {
        self.post_blocks(
            json!([{ "type": "section", "text": { "type": "mrkdwn", "text": text } }]),
            text,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct SlackPostResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn money_field(label: &str, value: Option<Decimal>) -> Option<serde_json::Value> {
    value.map(|v| {
        json!({
            "type": "mrkdwn",
            "text": format!("*{label}:* ${}", format_money(v)),
        })
    })
}

pub fn escalation_blocks(payload: &EscalationPayload) -> serde_json::Value {
    let mut fields = vec![
        json!({"type": "mrkdwn", "text": format!("*Influencer:* {} ({})", payload.influencer_name, payload.influencer_email)}),
        json!({"type": "mrkdwn", "text": format!("*Client:* {}", payload.client_name)}),
    ];
    fields.extend(money_field("Their ask", payload.proposed_rate));
    fields.extend(money_field("Our rate", payload.our_rate));

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": "🚨 Negotiation escalated", "emoji": true}
        }),
        json!({"type": "section", "fields": fields}),
        json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("*Reason:* {}", payload.escalation_reason)}
        }),
    ];
    if let Some(quote) = &payload.evidence_quote {
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("> {quote}")}
        }));
    }
    if !payload.suggested_actions.is_empty() {
        let actions = payload
            .suggested_actions
            .iter()
            .map(|a| format!("• {a}"))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("*Suggested actions:*\n{actions}")}
        }));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{"type": "mrkdwn", "text": format!("<{}|Open thread>", payload.details_link)}]
    }));
    serde_json::Value::Array(blocks)
}

fn escalation_fallback(payload: &EscalationPayload) -> String {
    format!(
        "Escalation: {} ({}) — {}",
        payload.influencer_name, payload.client_name, payload.escalation_reason
    )
}

pub fn agreement_blocks(payload: &AgreementPayload) -> serde_json::Value {
    let mentions = if payload.mention_users.is_empty() {
        String::new()
    } else {
        payload
            .mention_users
            .iter()
            .map(|u| format!("<@{u}>"))
            .collect::<Vec<_>>()
            .join(" ")
            + "\n"
    };
    let next_steps = payload
        .next_steps
        .iter()
        .map(|s| format!("• {s}"))
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::json!([
        {
            "type": "header",
            "text": {"type": "plain_text", "text": "✅ Deal agreed", "emoji": true}
        },
        {
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!(
                "{mentions}*{name}* ({email}) agreed at *${rate}* for {deliverables} on {platform}.\nCPM achieved: ${cpm}",
                name = payload.influencer_name,
                email = payload.influencer_email,
                rate = format_money(payload.agreed_rate),
                deliverables = payload.deliverables,
                platform = payload.platform,
                cpm = format_money(payload.cpm_achieved),
            )}
        },
        {
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("*Next steps:*\n{next_steps}")}
        },
        {
            "type": "context",
            "elements": [{"type": "mrkdwn", "text": format!("thread `{}` · client {}", payload.thread_id, payload.client_name)}]
        }
    ])
}

fn agreement_fallback(payload: &AgreementPayload) -> String {
    format!(
        "Agreement: {} at ${} ({})",
        payload.influencer_name,
        format_money(payload.agreed_rate),
        payload.client_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn escalation() -> EscalationPayload {
        EscalationPayload {
            influencer_name: "Jamie Rivers".into(),
            influencer_email: "jamie@example.com".into(),
            client_name: "Acme".into(),
            escalation_reason: "proposed rate $1,800.00 implies $36.00 CPM, exceeds $30.00 ceiling"
                .into(),
            evidence_quote: Some("I need $1,800 for this".into()),
            proposed_rate: Some(dec!(1800)),
            our_rate: Some(dec!(1000)),
            suggested_actions: vec!["Approve the higher rate".into(), "Reject and close".into()],
            details_link: "https://mail.example.com/thread/t1".into(),
        }
    }

    #[test]
    fn escalation_blocks_carry_reason_and_evidence() {
        let blocks = escalation_blocks(&escalation());
        let rendered = blocks.to_string();
        assert!(rendered.contains("exceeds $30.00 ceiling"));
        assert!(rendered.contains("I need $1,800 for this"));
        assert!(rendered.contains("$1,800.00"));
        assert!(rendered.contains("Approve the higher rate"));
    }

    #[test]
    fn agreement_blocks_mention_users_and_cpm() {
        let payload = AgreementPayload {
            influencer_name: "Jamie Rivers".into(),
            influencer_email: "jamie@example.com".into(),
            client_name: "Acme".into(),
            agreed_rate: dec!(1200),
            platform: Platform::Instagram,
            deliverables: "1x Instagram reel".into(),
            cpm_achieved: dec!(24),
            thread_id: "t1".into(),
            next_steps: vec!["Send the contract".into()],
            mention_users: vec!["U123".into()],
        };
        let rendered = agreement_blocks(&payload).to_string();
        assert!(rendered.contains("<@U123>"));
        assert!(rendered.contains("$1,200.00"));
        assert!(rendered.contains("$24.00"));
        assert!(rendered.contains("Send the contract"));
    }
}

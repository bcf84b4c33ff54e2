//! Gmail REST transport.
//!
//! Thin client over the Gmail v1 API: raw RFC 2822 sends with reply
//! threading, history-based inbound fetch with an unread-scan fallback,
//! thread metadata for takeover detection, and push-notification watch
//! setup. Auth is a bearer token supplied by the deployment.

use crate::email::{
    extract_latest_reply, html_to_text, takeover, EmailTransport, InboundEmail, OutboundEmail,
    SendReceipt, ThreadMessage, ThreadMetadata, WatchStatus,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UNREAD_SCAN_LIMIT: u32 = 25;

pub struct GmailTransport {
    http: reqwest::Client,
    access_token: String,
    pub account_email: String,
}

impl GmailTransport {
    pub fn new(http: reqwest::Client, access_token: String, account_email: String) -> Self {
        Self {
            http,
            access_token,
            account_email,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let resp = self
            .http
            .get(format!("{GMAIL_API_BASE}{path}"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("gmail GET {path}"))?;
        Self::read_json(resp, path).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{GMAIL_API_BASE}{path}"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("gmail POST {path}"))?;
        Self::read_json(resp, path).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        path: &str,
    ) -> Result<T> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("gmail {path} {}: {snippet}", status.as_u16()));
        }
        serde_json::from_str(&body).with_context(|| format!("gmail {path} json parse"))
    }

    async fn fetch_message(&self, id: &str) -> Result<Option<InboundEmail>> {
        let message: GmailMessage = self
            .get_json(&format!("/messages/{id}"), &[("format", "full".to_string())])
            .await?;
        Ok(parse_message(message))
    }
}

#[async_trait]
impl EmailTransport for GmailTransport {
    async fn send(&self, outbound: &OutboundEmail) -> Result<SendReceipt> {
        let raw = build_rfc2822(&self.account_email, outbound);
        let mut body = json!({ "raw": URL_SAFE_NO_PAD.encode(raw.as_bytes()) });
        if let Some(thread_id) = &outbound.thread_id {
            body["threadId"] = json!(thread_id);
        }
        let sent: SentMessage = self.post_json("/messages/send", body).await?;
        debug!(thread_id = %sent.thread_id, message_id = %sent.id, "email dispatched");
        Ok(SendReceipt {
            thread_id: sent.thread_id,
            message_id: sent.id,
        })
    }

    async fn fetch_inbound(&self, change_token: Option<&str>) -> Result<Vec<InboundEmail>> {
        let ids: Vec<String> = match change_token {
            Some(token) => {
                let history: HistoryResponse = self
                    .get_json(
                        "/history",
                        &[
                            ("startHistoryId", token.to_string()),
                            ("historyTypes", "messageAdded".to_string()),
                        ],
                    )
                    .await?;
                history
                    .history
                    .into_iter()
                    .flat_map(|h| h.messages_added)
                    .map(|added| added.message.id)
                    .collect()
            }
            None => {
                let listing: MessageListResponse = self
                    .get_json(
                        "/messages",
                        &[
                            ("q", "in:inbox is:unread".to_string()),
                            ("maxResults", UNREAD_SCAN_LIMIT.to_string()),
                        ],
                    )
                    .await?;
                listing.messages.into_iter().map(|m| m.id).collect()
            }
        };

        let mut inbound = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_message(&id).await {
                Ok(Some(email)) => inbound.push(email),
                Ok(None) => warn!(message_id = %id, "skipping unparseable message"),
                Err(e) => return Err(e),
            }
        }
        Ok(inbound)
    }

    async fn get_thread_metadata(&self, thread_id: &str) -> Result<ThreadMetadata> {
        let thread: GmailThread = self
            .get_json(
                &format!("/threads/{thread_id}"),
                &[
                    ("format", "metadata".to_string()),
                    ("metadataHeaders", "From".to_string()),
                ],
            )
            .await?;
        let messages = thread
            .messages
            .into_iter()
            .map(|m| ThreadMessage {
                from: m.payload.header("From").unwrap_or_default(),
                message_id: m.id,
            })
            .collect();
        Ok(ThreadMetadata { messages })
    }

    async fn setup_watch(&self, topic: &str) -> Result<WatchStatus> {
        let watch: WatchResponse = self
            .post_json(
                "/watch",
                json!({ "topicName": topic, "labelIds": ["INBOX"] }),
            )
            .await?;
        let expiration_ms: i64 = watch
            .expiration
            .parse()
            .context("gmail watch expiration parse")?;
        Ok(WatchStatus {
            expiration_timestamp: expiration_ms / 1000,
        })
    }
}

/// Assemble the raw message. Reply threading relies on `In-Reply-To` and
/// `References` being set together with the transport-level thread id.
fn build_rfc2822(from: &str, outbound: &OutboundEmail) -> String {
    let mut raw = String::new();
    raw.push_str(&format!("From: {from}\r\n"));
    raw.push_str(&format!("To: {}\r\n", outbound.to));
    raw.push_str(&format!("Subject: {}\r\n", outbound.subject));
    if let Some(in_reply_to) = &outbound.in_reply_to {
        raw.push_str(&format!("In-Reply-To: {in_reply_to}\r\n"));
    }
    if let Some(references) = &outbound.references {
        raw.push_str(&format!("References: {references}\r\n"));
    }
    raw.push_str("MIME-Version: 1.0\r\n");
    raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    raw.push_str("\r\n");
    raw.push_str(&outbound.body);
    raw
}

fn parse_message(message: GmailMessage) -> Option<InboundEmail> {
    let from_header = message.payload.header("From")?;
    let from_email = takeover::parse_sender_email(&from_header)?;
    let subject = message.payload.header("Subject").unwrap_or_default();

    let body_text = match find_body(&message.payload, "text/plain") {
        Some(text) => text,
        None => html_to_text(&find_body(&message.payload, "text/html")?),
    };

    let received_at = message
        .internal_date
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        thread_id: message.thread_id,
        message_id: message.id,
        from_email,
        subject,
        body_text: extract_latest_reply(&body_text),
        received_at,
    })
}

/// Depth-first search for the first part of the wanted mime type.
fn find_body(part: &GmailPart, mime_type: &str) -> Option<String> {
    if part.mime_type == mime_type {
        if let Some(data) = &part.body.data {
            return decode_base64url(data);
        }
    }
    part.parts
        .iter()
        .find_map(|child| find_body(child, mime_type))
}

fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryRecord {
    #[serde(default, rename = "messagesAdded")]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default, rename = "internalDate")]
    internal_date: String,
    payload: GmailPart,
}

#[derive(Debug, Default, Deserialize)]
struct GmailPart {
    #[serde(default, rename = "mimeType")]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: GmailBody,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

impl GmailPart {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct GmailBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<GmailThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct GmailThreadMessage {
    id: String,
    payload: GmailPart,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(default)]
    expiration: String,
}

//! Email transport interface and message parsing helpers.
//!
//! The negotiation core only ever talks to [`EmailTransport`]; the Gmail
//! REST implementation lives in [`gmail`], and a disabled stand-in covers
//! deployments without email credentials. Inbound parsing extracts the
//! latest reply text only, with a text/html fallback for multipart bodies.

pub mod gmail;
pub mod takeover;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An email the pipeline wants delivered. Replies into an existing thread
/// set `thread_id`, `in_reply_to`, and `references` together so every mail
/// client keeps the conversation threaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub thread_id: String,
    pub message_id: String,
}

/// One inbound reply, already reduced to its latest text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub thread_id: String,
    pub message_id: String,
    pub from_email: String,
    pub subject: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub from: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub messages: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    /// Unix seconds at which the push watch expires. Persisted so renewal
    /// is driven by the stored timestamp, not process uptime.
    pub expiration_timestamp: i64,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, outbound: &OutboundEmail) -> anyhow::Result<SendReceipt>;
    async fn fetch_inbound(&self, change_token: Option<&str>) -> anyhow::Result<Vec<InboundEmail>>;
    async fn get_thread_metadata(&self, thread_id: &str) -> anyhow::Result<ThreadMetadata>;
    async fn setup_watch(&self, topic: &str) -> anyhow::Result<WatchStatus>;
}

/// Stand-in when no email credentials are configured: sends fail loudly,
/// reads return nothing.
pub struct DisabledEmailTransport;

#[async_trait]
impl EmailTransport for DisabledEmailTransport {
    async fn send(&self, outbound: &OutboundEmail) -> anyhow::Result<SendReceipt> {
        anyhow::bail!(
            "email transport disabled (no credentials); dropping send to {}",
            outbound.to
        )
    }

    async fn fetch_inbound(&self, _change_token: Option<&str>) -> anyhow::Result<Vec<InboundEmail>> {
        Ok(Vec::new())
    }

    async fn get_thread_metadata(&self, _thread_id: &str) -> anyhow::Result<ThreadMetadata> {
        Ok(ThreadMetadata::default())
    }

    async fn setup_watch(&self, _topic: &str) -> anyhow::Result<WatchStatus> {
        anyhow::bail!("email transport disabled (no credentials); cannot set up watch")
    }
}

/// Reduce a reply body to the text its author actually typed: drop quoted
/// history, quote markers, and the trailing signature block.
pub fn extract_latest_reply(body_text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in body_text.lines() {
        let trimmed = line.trim_start();
        if is_quote_header(trimmed) || trimmed.starts_with("-----Original Message-----") {
            break;
        }
        if line.trim() == "--" {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_string()
}

/// "On Tue, Mar 4, 2025 at 2:11 PM Jamie Rivers <jamie@example.com> wrote:"
fn is_quote_header(line: &str) -> bool {
    line.starts_with("On ") && line.trim_end().ends_with("wrote:")
}

/// Crude html-to-text used only as the multipart fallback when a message
/// has no text/plain part.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut chars = html.chars();
    while let Some(c) = chars.next() {
        match c {
            '<' => {
                in_tag = true;
                // block-level closers become line breaks
                let rest: String = chars.clone().take(12).collect::<String>().to_lowercase();
                if rest.starts_with("br")
                    || rest.starts_with("/p")
                    || rest.starts_with("/div")
                    || rest.starts_with("/h")
                {
                    text.push('\n');
                }
            }
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            _ => text.push(c),
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    // collapse the blank-line runs tag stripping leaves behind
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim().to_string()
}

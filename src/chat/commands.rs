//! Slash command parsing for `/claim` and `/resume`.
//!
//! Commands are acknowledged immediately with an ephemeral response and
//! mutate only the ownership registry. No channel-visible notification
//! accompanies a claim or resume; the handoff is silent.

use crate::negotiation::ownership::OwnershipRegistry;
use serde::Deserialize;

/// Form payload Slack posts for a slash command; only the fields the
/// handlers read.
#[derive(Debug, Clone, Deserialize)]
pub struct SlashCommandForm {
    pub command: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Claim { identifier: String },
    Resume { identifier: String },
}

pub fn parse_slash_command(command: &str, text: &str) -> Result<SlashCommand, String> {
    let identifier = text.trim();
    if identifier.is_empty() {
        return Err(format!("usage: {command} <thread or influencer>"));
    }
    match command.trim() {
        "/claim" => Ok(SlashCommand::Claim {
            identifier: identifier.to_string(),
        }),
        "/resume" => Ok(SlashCommand::Resume {
            identifier: identifier.to_string(),
        }),
        other => Err(format!("unknown command {other}")),
    }
}

/// Apply a parsed command against the registry. `resolve` maps whatever the
/// operator typed (thread id or influencer name) to a thread id. Returns
/// the ephemeral acknowledgement text.
pub fn handle_slash_command(
    command: SlashCommand,
    user_name: &str,
    registry: &OwnershipRegistry,
    resolve: impl Fn(&str) -> Option<String>,
) -> String {
    match command {
        SlashCommand::Claim { identifier } => match resolve(&identifier) {
            Some(thread_id) => {
                registry.claim(&thread_id, user_name);
                format!("You've got it — thread `{thread_id}` is yours. The agent will stay out.")
            }
            None => format!("No active negotiation matches `{identifier}`."),
        },
        SlashCommand::Resume { identifier } => match resolve(&identifier) {
            Some(thread_id) => {
                registry.resume(&thread_id);
                format!("Thread `{thread_id}` handed back to the agent.")
            }
            None => format!("No active negotiation matches `{identifier}`."),
        },
    }
}

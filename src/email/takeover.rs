//! Human-reply detection.
//!
//! A thread normally only contains the agent and the influencer. The
//! moment any other sender shows up in the thread's `From` headers, a
//! human has stepped in and the agent must go silent on that thread.
//! Auto-forwarded messages are a known false-positive source; `/resume`
//! is the recovery path.

use crate::email::ThreadMetadata;

/// Pull the address out of a `From` header, handling `"Name <email>"`,
/// `<email>`, and bare-address forms. Returns the address lowercased.
pub fn parse_sender_email(from_header: &str) -> Option<String> {
    let header = from_header.trim();
    if header.is_empty() {
        return None;
    }
    if let (Some(open), Some(close)) = (header.rfind('<'), header.rfind('>')) {
        if open < close {
            let inner = header[open + 1..close].trim();
            if inner.contains('@') {
                return Some(inner.to_ascii_lowercase());
            }
            return None;
        }
    }
    if header.contains('@') && !header.contains(' ') {
        return Some(header.trim_matches('"').to_ascii_lowercase());
    }
    None
}

/// The first sender in the thread who is neither the agent nor the
/// influencer, if any. A hit means a human has replied on the thread.
pub fn find_foreign_sender(
    metadata: &ThreadMetadata,
    agent_email: &str,
    influencer_email: &str,
) -> Option<String> {
    let agent = agent_email.to_ascii_lowercase();
    let influencer = influencer_email.to_ascii_lowercase();
    for message in &metadata.messages {
        let Some(sender) = parse_sender_email(&message.from) else {
            continue;
        };
        if sender != agent && sender != influencer {
            return Some(sender);
        }
    }
    None
}

//! DNS message helpers shared by the plugins.
//!
//! The wire codec itself is `hickory-proto`; this module holds the handful of
//! operations the pipeline performs on every message.

use hickory_proto::op::{Message, MessageType};

use crate::error::Result;

/// Media type for DNS wire messages carried over HTTPS (RFC 8484).
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Decode a message from wire format.
pub fn decode(data: &[u8]) -> Result<Message> {
    Ok(Message::from_vec(data)?)
}

/// Encode a message to wire format.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(message.to_vec()?)
}

/// Whether the message carries the response flag.
pub fn is_response(message: &Message) -> bool {
    message.message_type() == MessageType::Response
}

/// Mark the message as finalized so no further forwarding happens.
pub fn mark_answered(message: &mut Message) {
    message.set_message_type(MessageType::Response);
}

/// Build the cache key for a message.
///
/// Concatenates name, type and class of every question in order, so the same
/// questions in a different order produce a different key.
pub fn cache_key(message: &Message) -> String {
    let mut key = String::with_capacity(64);
    for q in message.queries() {
        key.push_str(&q.name().to_string());
        key.push_str(&q.query_type().to_string());
        key.push_str(&q.query_class().to_string());
    }
    key
}

/// Name of the first question with a single trailing root dot removed.
pub fn first_domain(message: &Message) -> Option<String> {
    let query = message.queries().first()?;
    let mut domain = query.name().to_string();
    if domain.ends_with('.') {
        domain.pop();
    }
    Some(domain)
}

/// Short `name/type` rendering of the questions, for log lines.
pub fn describe_questions(message: &Message) -> String {
    message
        .queries()
        .iter()
        .map(|q| format!("{}/{}", q.name(), q.query_type()))
        .collect::<Vec<_>>()
        .join(",")
}

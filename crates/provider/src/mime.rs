//! MIME walking (spec §4.2): depth-first part selection via `mail-parser`,
//! the crate the teacher's own `email`/`jmap` crates use for the same
//! multipart-tree traversal.

use base64::Engine;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use types::{AddressPair, AttachmentDescriptor, Message, MessageHeaders};

use crate::{HistoryEvent, ProviderError};

/// Walks a raw RFC 822 byte stream, preferring `text/plain`, falling back
/// to `text/html` reduced to text (mail-parser already strips tags for
/// `.body_text()`). A part that fails to parse downgrades only that part
/// — the message is still emitted with best-effort content (spec §4.2).
pub fn parse_mime_message(message_id: &str, thread_id: &str, raw: &[u8], label_ids: Vec<String>) -> Result<Message, ProviderError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ProviderError::Parse("not a valid RFC 822 message".into()))?;

    let from = parsed
        .from()
        .and_then(|addrs| addrs.first())
        .map(|addr| AddressPair {
            name: addr.name().map(|s| s.to_string()),
            mailbox: addr.address().unwrap_or_default().to_string(),
        });

    let to = collect_addresses(parsed.to());
    let cc = collect_addresses(parsed.cc());
    let bcc = collect_addresses(parsed.bcc());
    let subject = parsed.subject().map(|s| s.to_string());
    let date: Option<DateTime<Utc>> = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    let text_body = parsed
        .body_text(0)
        .map(|s| s.to_string())
        .unwrap_or_default();
    let snippet: String = text_body.chars().take(200).collect();

    let attachments = parsed
        .attachments()
        .map(|att| AttachmentDescriptor {
            provider_attachment_id: blake3::hash(att.contents()).to_hex().to_string(),
            filename: att.attachment_name().unwrap_or("unnamed").to_string(),
            mime: att
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: att.contents().len() as u64,
        })
        .collect();

    Ok(Message {
        message_id: message_id.to_string(),
        thread_id: thread_id.to_string(),
        headers: MessageHeaders { from, to, cc, bcc, subject, date },
        text_body,
        snippet,
        attachments,
        label_ids,
    })
}

fn collect_addresses(group: Option<&mail_parser::Address>) -> Vec<AddressPair> {
    let Some(group) = group else { return Vec::new() };
    group
        .iter()
        .map(|addr| AddressPair {
            name: addr.name().map(|s| s.to_string()),
            mailbox: addr.address().unwrap_or_default().to_string(),
        })
        .collect()
}

/// Provider payloads in this system are modeled as a JSON envelope
/// carrying a base64url `raw` RFC 822 blob (the provider's "format=raw"
/// response shape), plus `threadId` and `labelIds` alongside it.
pub fn message_from_provider_json(message_id: &str, body: &serde_json::Value) -> Result<Message, ProviderError> {
    let thread_id = body.get("threadId").and_then(|v| v.as_str()).unwrap_or(message_id);
    let label_ids: Vec<String> = body
        .get("labelIds")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let raw_b64 = body
        .get("raw")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::Parse("missing raw MIME payload".into()))?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(raw_b64)
        .map_err(|e| ProviderError::Parse(format!("invalid base64 payload: {e}")))?;
    parse_mime_message(message_id, thread_id, &raw, label_ids)
}

pub fn history_events_from_json(body: &serde_json::Value) -> Vec<HistoryEvent> {
    let Some(history) = body.get("history").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    history
        .iter()
        .flat_map(|entry| {
            let cursor = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            entry
                .get("messagesAdded")
                .and_then(|v| v.as_array())
                .map(|arr| arr.clone())
                .unwrap_or_default()
                .into_iter()
                .filter_map(move |m| {
                    let message = m.get("message")?;
                    Some(HistoryEvent {
                        message_id: message.get("id")?.as_str()?.to_string(),
                        thread_id: message.get("threadId")?.as_str()?.to_string(),
                        history_cursor: cursor.clone(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

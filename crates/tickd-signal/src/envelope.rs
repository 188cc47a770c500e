//! Envelope JSON parsing.
//!
//! The sidecar emits one JSON envelope per line. Only user data messages
//! yield a [`Message`]; receipts, typing notifications and other events have
//! no `dataMessage` and are ignored. Remote deletes are logged and skipped.

use std::sync::OnceLock;

use chrono::TimeZone;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use tickd_core::{Attachment, Contact, Group, Message};

/// Canonical UUID shape, dashed or undashed, case-insensitive. Signal
/// sometimes puts the sender UUID in `source` instead of `sourceUuid`.
fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^[0-9a-f]{8}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{12}$",
        )
        .expect("static regex")
    })
}

#[derive(Debug, Deserialize)]
struct RawLine {
    envelope: Option<RawEnvelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    source: Option<String>,
    source_number: Option<String>,
    source_uuid: Option<String>,
    source_name: Option<String>,
    #[serde(default)]
    timestamp: i64,
    account: Option<String>,
    data_message: Option<RawDataMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataMessage {
    message: Option<String>,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    group_info: Option<RawGroupInfo>,
    remote_delete: Option<RawRemoteDelete>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAttachment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    upload_timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroupInfo {
    #[serde(default)]
    group_id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRemoteDelete {
    timestamp: Option<i64>,
}

/// Parse a newline-delimited batch of envelopes into messages, newest last.
///
/// Malformed lines and non-data envelopes are dropped with a log line; they
/// never fail the batch.
pub fn parse_batch(raw: &str) -> Vec<Message> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect()
}

/// Dedup/alignment key of one raw line: `(timestamp_ms, sourceUuid | source)`.
///
/// Mirrors the identity the sensor uses to match raw JSON back to parsed
/// messages without re-parsing whole envelopes.
pub fn envelope_key(line: &str) -> Option<(i64, Option<String>)> {
    let parsed: RawLine = serde_json::from_str(line).ok()?;
    let envelope = parsed.envelope?;
    let source = envelope.source_uuid.or(envelope.source);
    Some((envelope.timestamp, source))
}

fn parse_line(line: &str) -> Option<Message> {
    let parsed: RawLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            warn!("dropping malformed envelope line: {e}");
            return None;
        }
    };
    let envelope = parsed.envelope?;
    let data = envelope.data_message?;

    if let Some(delete) = data.remote_delete {
        info!(timestamp = ?delete.timestamp, "remote delete received, skipping");
        return None;
    }

    let source = envelope.source.or(envelope.source_number);
    let (uuid, number) = match source {
        Some(s) if uuid_regex().is_match(&s) => (Some(s), None),
        other => (envelope.source_uuid, other),
    };

    let sender = Contact {
        uuid,
        number,
        name: envelope.source_name,
    };

    let timestamp = match chrono::Local.timestamp_millis_opt(envelope.timestamp).single() {
        Some(dt) => dt.naive_local(),
        None => {
            warn!(timestamp = envelope.timestamp, "envelope timestamp out of range, skipping");
            return None;
        }
    };

    let attachments = data
        .attachments
        .into_iter()
        .map(|a| Attachment {
            id: a.id,
            content_type: a.content_type,
            filename: a.filename,
            size: a.size,
            upload_timestamp_ms: a.upload_timestamp,
            path: None,
        })
        .collect();

    let group = data.group_info.map(|g| Group {
        id: g.group_id,
        name: g.name.unwrap_or_else(|| "Unknown".to_string()),
    });
    let is_group_message = group.is_some();

    Some(Message {
        sender,
        timestamp,
        text: data.message,
        attachments,
        group,
        is_group_message,
        account: envelope.account,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY: &str = r#"{"envelope":{"source":"+41797654321","sourceNumber":"+41797654321","sourceUuid":"11112222-3333-4444-5555-666677778888","sourceName":"Alice","timestamp":1731600000000,"account":"+41791234567","dataMessage":{"message":"ticket","attachments":[{"id":"A1","contentType":"image/jpeg","filename":"r.jpg","size":1000,"uploadTimestamp":1731600000123}],"groupInfo":{"groupId":"G1","name":"Tickets"}}}}"#;

    #[test]
    fn parses_a_group_message_with_attachment() {
        let messages = parse_batch(HAPPY);
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.sender.number.as_deref(), Some("+41797654321"));
        assert_eq!(
            m.sender.uuid.as_deref(),
            Some("11112222-3333-4444-5555-666677778888")
        );
        assert_eq!(m.sender.name.as_deref(), Some("Alice"));
        assert_eq!(m.text.as_deref(), Some("ticket"));
        assert!(m.is_group_message);
        assert_eq!(m.group.as_ref().unwrap().id, "G1");
        assert_eq!(m.attachments.len(), 1);
        assert_eq!(m.attachments[0].id, "A1");
        assert_eq!(m.attachments[0].content_type, "image/jpeg");
        assert_eq!(m.account.as_deref(), Some("+41791234567"));
        assert!(m.has_image_attachment());
    }

    #[test]
    fn uuid_shaped_source_leaves_number_empty() {
        let line = r#"{"envelope":{"source":"11112222-3333-4444-5555-666677778888","timestamp":1731600000000,"dataMessage":{"message":"hi"}}}"#;
        let messages = parse_batch(line);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].sender.uuid.as_deref(),
            Some("11112222-3333-4444-5555-666677778888")
        );
        assert!(messages[0].sender.number.is_none());
    }

    #[test]
    fn undashed_uuid_source_is_recognised() {
        let line = r#"{"envelope":{"source":"11112222333344445555666677778888","timestamp":1731600000000,"dataMessage":{"message":"hi"}}}"#;
        let messages = parse_batch(line);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].sender.number.is_none());
        assert!(messages[0].sender.uuid.is_some());
    }

    #[test]
    fn phone_source_keeps_number_and_source_uuid() {
        let line = r#"{"envelope":{"source":"+41797654321","sourceUuid":"11112222-3333-4444-5555-666677778888","timestamp":1731600000000,"dataMessage":{"message":"hi"}}}"#;
        let messages = parse_batch(line);
        assert_eq!(messages[0].sender.number.as_deref(), Some("+41797654321"));
        assert!(messages[0].sender.uuid.is_some());
    }

    #[test]
    fn remote_delete_is_skipped() {
        let line = r#"{"envelope":{"source":"+41797654321","timestamp":1731600000000,"dataMessage":{"remoteDelete":{"timestamp":1731599000000}}}}"#;
        assert!(parse_batch(line).is_empty());
    }

    #[test]
    fn read_receipt_yields_nothing() {
        // No dataMessage at all — e.g. a receiptMessage envelope.
        let line = r#"{"envelope":{"source":"+41797654321","timestamp":1731600000000,"receiptMessage":{"when":1731600000000,"isDelivery":true}}}"#;
        assert!(parse_batch(line).is_empty());
    }

    #[test]
    fn malformed_lines_are_dropped_not_fatal() {
        let batch = format!("not json at all\n{HAPPY}\n{{\"envelope\":");
        let messages = parse_batch(&batch);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn attachment_defaults_for_missing_fields() {
        let line = r#"{"envelope":{"source":"+41797654321","timestamp":1731600000000,"dataMessage":{"attachments":[{"id":"A2"}]}}}"#;
        let messages = parse_batch(line);
        let att = &messages[0].attachments[0];
        assert_eq!(att.content_type, "");
        assert_eq!(att.filename, "");
        assert_eq!(att.size, 0);
    }

    #[test]
    fn direct_message_has_no_group() {
        let line = r#"{"envelope":{"source":"+41797654321","timestamp":1731600000000,"dataMessage":{"message":"dm"}}}"#;
        let messages = parse_batch(line);
        assert!(!messages[0].is_group_message);
        assert!(messages[0].group.is_none());
    }

    #[test]
    fn envelope_key_prefers_source_uuid() {
        let (ts, source) = envelope_key(HAPPY).unwrap();
        assert_eq!(ts, 1731600000000);
        assert_eq!(source.as_deref(), Some("11112222-3333-4444-5555-666677778888"));

        let line = r#"{"envelope":{"source":"+41797654321","timestamp":5,"dataMessage":{}}}"#;
        let (ts, source) = envelope_key(line).unwrap();
        assert_eq!(ts, 5);
        assert_eq!(source.as_deref(), Some("+41797654321"));
    }
}

//! Job requests and their run-scoped tag record.
//!
//! The tag bag carries everything the job needs to reconstruct the message
//! without re-hitting the sidecar. It is written once by the sensor and read
//! directly by the stages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use tickd_core::Message;

/// Millisecond-stable ISO form used for tags and the run key.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Attachment descriptor inside the tag bag. Paths already exist on disk
/// when the request is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTag {
    pub path: String,
    pub content_type: String,
    pub filename: String,
    pub id: String,
}

/// Run-scoped record written once per job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTags {
    pub message_timestamp: String,
    pub sender_uuid: String,
    pub sender_number: String,
    pub sender_name: String,
    pub group_id: String,
    pub group_name: String,
    /// JSON-encoded list of [`AttachmentTag`].
    pub attachment_paths: String,
    pub message_text: String,
    pub is_group_message: bool,
    pub test_mode: bool,
}

impl RunTags {
    pub fn from_message(message: &Message, test_mode: bool) -> Self {
        let attachments: Vec<AttachmentTag> = message
            .attachments
            .iter()
            .filter_map(|att| {
                att.path.as_ref().map(|path| AttachmentTag {
                    path: path.clone(),
                    content_type: att.content_type.clone(),
                    filename: att.filename.clone(),
                    id: att.id.clone(),
                })
            })
            .collect();

        Self {
            message_timestamp: format_timestamp(message.timestamp),
            sender_uuid: message.sender.uuid.clone().unwrap_or_default(),
            sender_number: message.sender.number.clone().unwrap_or_default(),
            sender_name: message.sender.name.clone().unwrap_or_default(),
            group_id: message.group.as_ref().map(|g| g.id.clone()).unwrap_or_default(),
            group_name: message
                .group
                .as_ref()
                .map(|g| g.name.clone())
                .unwrap_or_default(),
            attachment_paths: serde_json::to_string(&attachments).unwrap_or_else(|_| "[]".into()),
            message_text: message.text.clone().unwrap_or_default(),
            is_group_message: message.is_group_message,
            test_mode,
        }
    }

    /// Decode the attachment descriptors.
    pub fn attachments(&self) -> Result<Vec<AttachmentTag>, serde_json::Error> {
        if self.attachment_paths.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.attachment_paths)
    }
}

/// What the sensor hands to the engine: a stable identity plus the tag bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub run_key: String,
    pub tags: RunTags,
}

impl JobRequest {
    pub fn from_message(message: &Message, test_mode: bool) -> Self {
        let tags = RunTags::from_message(message, test_mode);
        let run_key = run_key(&tags);
        Self { run_key, tags }
    }
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// `signal_message_<iso timestamp>_<uuid | number | "unknown">` — two runs
/// over the same message produce byte-identical keys.
pub fn run_key(tags: &RunTags) -> String {
    let sender = if !tags.sender_uuid.is_empty() {
        tags.sender_uuid.as_str()
    } else if !tags.sender_number.is_empty() {
        tags.sender_number.as_str()
    } else {
        "unknown"
    };
    format!("signal_message_{}_{}", tags.message_timestamp, sender)
}

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A Signal contact as observed on an inbound envelope.
///
/// `uuid` is the stable identity; number and name are best-effort and may
/// arrive later than the first message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub uuid: Option<String>,
    pub number: Option<String>,
    pub name: Option<String>,
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.number, &self.uuid) {
            (Some(name), _, _) => f.write_str(name),
            (None, Some(number), _) => f.write_str(number),
            (None, None, Some(uuid)) => f.write_str(uuid),
            _ => f.write_str("unknown"),
        }
    }
}

/// A Signal group (opaque id + mutable display name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

/// A file delivered with a Signal message.
///
/// `path` is set once the sidecar has materialised the bytes on disk; every
/// later stage treats the file as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub content_type: String,
    pub filename: String,
    pub size: i64,
    pub upload_timestamp_ms: i64,
    pub path: Option<String>,
}

/// File suffixes accepted as images when the sidecar omits the content type.
const IMAGE_SUFFIXES: [&str; 5] = [".jpg", ".jpeg", ".png", ".webp", ".gif"];

impl Attachment {
    /// True for `image/*` content types, or for image filename suffixes when
    /// the content type is empty.
    pub fn is_image(&self) -> bool {
        if self.content_type.starts_with("image/") {
            return true;
        }
        if self.content_type.is_empty() {
            let lower = self.filename.to_lowercase();
            return IMAGE_SUFFIXES.iter().any(|s| lower.ends_with(s));
        }
        false
    }
}

/// One inbound Signal data message.
///
/// `timestamp` is the sender-side millisecond timestamp normalised to naive
/// local time; `(sender.uuid, timestamp)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Contact,
    pub timestamp: NaiveDateTime,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub group: Option<Group>,
    pub is_group_message: bool,
    /// Signal account the bot was logged in as when it received this.
    pub account: Option<String>,
}

impl Message {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn has_image_attachment(&self) -> bool {
        self.attachments.iter().any(Attachment::is_image)
    }

    /// Attachments the extraction stage will send to the vision model.
    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_image())
    }
}

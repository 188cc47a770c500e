//! High-level Signal operations built on the sidecar runner.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use tickd_core::config::SignalConfig;
use tickd_core::{Group, Message};

use crate::envelope;
use crate::error::Result;
use crate::sidecar::Sidecar;

/// The transport adapter: receive/parse/download/send/listGroups.
///
/// Never call [`SignalAdapter::receive`] concurrently — the sidecar consumes
/// messages exactly once and marks them read on delivery.
pub struct SignalAdapter {
    sidecar: Sidecar,
    attachment_dir: PathBuf,
}

impl SignalAdapter {
    pub fn new(cfg: &SignalConfig) -> Self {
        Self {
            sidecar: Sidecar::new(&cfg.sidecar_path, &cfg.phone_number),
            attachment_dir: PathBuf::from(&cfg.attachment_dir),
        }
    }

    pub fn attachment_dir(&self) -> &Path {
        &self.attachment_dir
    }

    /// Pull up to `max` envelopes from the sidecar, newest last, marking them
    /// read. Returns the raw newline-delimited JSON batch.
    pub async fn receive(&self, max: u32) -> Result<String> {
        let max = max.to_string();
        self.sidecar
            .run(&[
                "-o",
                "json",
                "receive",
                "--max-messages",
                &max,
                "--send-read-receipts",
            ])
            .await
    }

    /// Parse a raw receive batch into messages.
    pub fn parse(&self, raw: &str) -> Vec<Message> {
        envelope::parse_batch(raw)
    }

    /// Ask the sidecar to materialise every attachment to
    /// `<attachment_dir>/<attachment id>` and record the local path.
    ///
    /// A failed download logs a warning and leaves that attachment without a
    /// path; it never aborts the rest of the batch.
    pub async fn download_attachments(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for message in &mut messages {
            for attachment in &mut message.attachments {
                if attachment.id.is_empty() {
                    continue;
                }
                let mut args = vec!["getAttachment", "--id", attachment.id.as_str()];
                if let Some(group) = &message.group {
                    args.push("--group");
                    args.push(group.id.as_str());
                }
                match self.sidecar.run(&args).await {
                    Ok(_) => {
                        let path = self.attachment_dir.join(&attachment.id);
                        attachment.path = Some(path.to_string_lossy().into_owned());
                    }
                    Err(e) => {
                        warn!(attachment_id = %attachment.id, "attachment download failed: {e}");
                    }
                }
            }
        }
        messages
    }

    /// Send `text` to a group. Fire-and-forget: a failure is logged and
    /// swallowed so notification paths can never crash a caller.
    pub async fn send_to_group(&self, group_id: &str, text: &str) {
        match self.sidecar.run(&["send", "-m", text, "-g", group_id]).await {
            Ok(_) => debug!(group_id, "message sent to group"),
            Err(e) => warn!(group_id, "group send failed: {e}"),
        }
    }

    /// List the groups the account belongs to.
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let out = self.sidecar.run(&["listGroups", "-d"]).await?;
        let groups = parse_group_list(&out);
        info!(count = groups.len(), "groups listed");
        Ok(groups)
    }
}

/// Parse the sidecar's `listGroups -d` output: one `Id: … Name: …` line per
/// group, with trailing `Description:`/`Active:` fields ignored.
fn parse_group_list(out: &str) -> Vec<Group> {
    out.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("Id:")?.trim_start();
            let (id, tail) = rest.split_once(char::is_whitespace)?;
            let name = tail
                .split_once("Name:")
                .map(|(_, n)| n)
                .unwrap_or("")
                .split(" Description:")
                .next()
                .unwrap_or("")
                .split(" Active:")
                .next()
                .unwrap_or("")
                .trim();
            Some(Group {
                id: id.to_string(),
                name: if name.is_empty() {
                    "Unknown".to_string()
                } else {
                    name.to_string()
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickd_core::{Attachment, Contact};

    fn config(sidecar: &str, dir: &Path) -> SignalConfig {
        SignalConfig {
            phone_number: "+41791234567".into(),
            sidecar_path: sidecar.into(),
            attachment_dir: dir.to_string_lossy().into_owned(),
            default_group_id: None,
        }
    }

    fn message_with_attachment(group: Option<Group>) -> Message {
        Message {
            sender: Contact {
                uuid: Some("11112222-3333-4444-5555-666677778888".into()),
                number: Some("+41797654321".into()),
                name: Some("Alice".into()),
            },
            timestamp: chrono::NaiveDate::from_ymd_opt(2024, 11, 14)
                .unwrap()
                .and_hms_opt(18, 0, 0)
                .unwrap(),
            text: None,
            attachments: vec![Attachment {
                id: "A1".into(),
                content_type: "image/jpeg".into(),
                filename: "r.jpg".into(),
                size: 1000,
                upload_timestamp_ms: 0,
                path: None,
            }],
            group: group.clone(),
            is_group_message: group.is_some(),
            account: None,
        }
    }

    #[test]
    fn group_listing_is_parsed() {
        let out = "Id: abc123== Name: Tickets Description: shared receipts Active: true\n\
                   Id: def456== Name: Famille Active: true\n\
                   unrelated line";
        let groups = parse_group_list(out);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "abc123==");
        assert_eq!(groups[0].name, "Tickets");
        assert_eq!(groups[1].name, "Famille");
    }

    #[test]
    fn group_without_name_is_unknown() {
        let groups = parse_group_list("Id: xyz== Name:  Active: true");
        assert_eq!(groups[0].name, "Unknown");
    }

    #[tokio::test]
    async fn download_records_local_path() {
        let dir = tempfile::tempdir().unwrap();
        // `true` exits 0 for any arguments, standing in for getAttachment.
        let adapter = SignalAdapter::new(&config("true", dir.path()));
        let messages = adapter
            .download_attachments(vec![message_with_attachment(Some(Group {
                id: "G1".into(),
                name: "Tickets".into(),
            }))])
            .await;
        let expected = dir.path().join("A1");
        assert_eq!(
            messages[0].attachments[0].path.as_deref(),
            Some(expected.to_str().unwrap())
        );
    }

    #[tokio::test]
    async fn failed_download_leaves_path_unset() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SignalAdapter::new(&config("false", dir.path()));
        let messages = adapter
            .download_attachments(vec![message_with_attachment(None)])
            .await;
        assert!(messages[0].attachments[0].path.is_none());
    }

    #[tokio::test]
    async fn group_send_failure_does_not_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SignalAdapter::new(&config("false", dir.path()));
        // Must not panic or return an error.
        adapter.send_to_group("G1", "hello").await;
    }
}

//! The six stage bodies.
//!
//! Each stage takes typed inputs from its predecessors and wraps every
//! adapter error into a taxonomy kind at its boundary; the engine only ever
//! sees [`JobFailure`] values. Stages run in the order of
//! [`crate::stage::EXECUTION_ORDER`]; a failure stops the run and marks the
//! remaining stages skipped.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tickd_core::retry::RetryPolicy;
use tickd_core::{Attachment, Contact, ErrorKind, Group, Message, ReceiptData};
use tickd_db::PersistedMessage;
use tickd_extract::{ExtractionRequest, DEFAULT_TEMPLATE};
use tickd_sensor::request::TIMESTAMP_FORMAT;
use tickd_sensor::{JobRequest, RunTags};

use crate::context::PipelineContext;
use crate::engine::{JobFailure, JobRunner, ReceiptSummary};
use crate::stage::{StageId, StageState, EXECUTION_ORDER};

/// Executes the per-message DAG against the real adapters.
pub struct PipelineRunner {
    ctx: PipelineContext,
}

impl PipelineRunner {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl JobRunner for PipelineRunner {
    async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceiptSummary, JobFailure> {
        let mut progress = Progress::new(&request.run_key);

        // S1 — reconstruct the message purely from the tag bag.
        progress.check_cancelled(cancel, StageId::ReconstructMessage)?;
        progress.start(StageId::ReconstructMessage);
        let message = progress.finish(
            StageId::ReconstructMessage,
            reconstruct_message(&request.tags),
        )?;

        // S2 — persist message + attachments (idempotence hits succeed).
        progress.check_cancelled(cancel, StageId::PersistMessage)?;
        progress.start(StageId::PersistMessage);
        let persisted = progress.finish(
            StageId::PersistMessage,
            persist_message(&self.ctx, &message).await,
        )?;

        // S3 — prompt + vision call. Data-independent from S2; serialised
        // here, which the DAG permits.
        progress.check_cancelled(cancel, StageId::Extract)?;
        progress.start(StageId::Extract);
        let extraction =
            progress.finish(StageId::Extract, extract(&self.ctx, &message).await)?;

        // S4 — pure transform.
        progress.check_cancelled(cancel, StageId::Transform)?;
        progress.start(StageId::Transform);
        let receipt = progress.finish(
            StageId::Transform,
            transform(&extraction, persisted.message_id),
        )?;

        // S5 — persist the receipt aggregate.
        progress.check_cancelled(cancel, StageId::PersistReceipt)?;
        progress.start(StageId::PersistReceipt);
        let summary = progress.finish(
            StageId::PersistReceipt,
            persist_receipt(&self.ctx, &receipt, &persisted).await,
        )?;

        // S6 — the success notification itself is delivered by the terminal
        // observers; reaching this point is what makes them fire.
        progress.start(StageId::NotifySuccess);
        progress.succeed(StageId::NotifySuccess);
        Ok(summary)
    }
}

/// Per-run stage bookkeeping: logs transitions and marks the tail of the
/// DAG skipped on failure or cancellation.
struct Progress {
    run_key: String,
    states: Vec<(StageId, StageState)>,
}

impl Progress {
    fn new(run_key: &str) -> Self {
        Self {
            run_key: run_key.to_string(),
            states: EXECUTION_ORDER
                .iter()
                .map(|id| (*id, StageState::Pending))
                .collect(),
        }
    }

    fn set(&mut self, id: StageId, state: StageState) {
        if let Some(slot) = self.states.iter_mut().find(|(s, _)| *s == id) {
            slot.1 = state;
        }
    }

    fn start(&mut self, id: StageId) {
        debug!(run_key = %self.run_key, stage = %id, "stage started");
        self.set(id, StageState::Running);
    }

    fn succeed(&mut self, id: StageId) {
        self.set(id, StageState::Succeeded);
    }

    /// Record the stage result; on failure mark this stage failed and all
    /// not-yet-started stages skipped.
    fn finish<T>(
        &mut self,
        id: StageId,
        result: Result<T, JobFailure>,
    ) -> Result<T, JobFailure> {
        match result {
            Ok(value) => {
                self.succeed(id);
                Ok(value)
            }
            Err(failure) => {
                self.set(id, StageState::Failed);
                self.skip_pending();
                Err(failure)
            }
        }
    }

    /// Cooperative cancellation point between stages.
    fn check_cancelled(
        &mut self,
        cancel: &CancellationToken,
        next: StageId,
    ) -> Result<(), JobFailure> {
        if cancel.is_cancelled() {
            info!(run_key = %self.run_key, "job cancelled");
            self.skip_pending();
            return Err(JobFailure {
                stage: next,
                kind: ErrorKind::Cancelled,
                reason: "job cancelled before completion".to_string(),
            });
        }
        Ok(())
    }

    fn skip_pending(&mut self) {
        for (id, state) in &mut self.states {
            if *state == StageState::Pending {
                debug!(run_key = %self.run_key, stage = %id, "stage skipped");
                *state = StageState::Skipped;
            }
        }
    }
}

/// S1: rebuild the [`Message`] from the tag bag, dropping attachment paths
/// that no longer exist on disk. Fails fast when no image attachment
/// survives.
pub fn reconstruct_message(tags: &RunTags) -> Result<Message, JobFailure> {
    let fail = |reason: String| JobFailure {
        stage: StageId::ReconstructMessage,
        kind: ErrorKind::SidecarParse,
        reason,
    };

    let timestamp = parse_tag_timestamp(&tags.message_timestamp)
        .ok_or_else(|| fail(format!("unparsable timestamp {:?}", tags.message_timestamp)))?;

    let descriptors = tags
        .attachments()
        .map_err(|e| fail(format!("bad attachment descriptors: {e}")))?;

    let attachments: Vec<Attachment> = descriptors
        .into_iter()
        .filter(|d| {
            let exists = Path::new(&d.path).exists();
            if !exists {
                warn!(path = %d.path, "attachment file missing on disk, dropping");
            }
            exists
        })
        .map(|d| Attachment {
            id: d.id,
            content_type: d.content_type,
            filename: d.filename,
            size: 0,
            upload_timestamp_ms: 0,
            path: Some(d.path),
        })
        .collect();

    let message = Message {
        sender: Contact {
            uuid: non_empty(&tags.sender_uuid),
            number: non_empty(&tags.sender_number),
            name: non_empty(&tags.sender_name),
        },
        timestamp,
        text: non_empty(&tags.message_text),
        attachments,
        group: non_empty(&tags.group_id).map(|id| Group {
            id,
            name: if tags.group_name.is_empty() {
                "Unknown".to_string()
            } else {
                tags.group_name.clone()
            },
        }),
        is_group_message: tags.is_group_message,
        account: None,
    };

    if !message.has_image_attachment() {
        return Err(fail("no image attachment survived reconstruction".to_string()));
    }
    Ok(message)
}

/// Accept an explicit offset or trailing `Z` (normalised to naive local
/// time), else the sensor's own millisecond format.
fn parse_tag_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// S2: one transaction for sender, group, message, attachments, mappings.
async fn persist_message(
    ctx: &PipelineContext,
    message: &Message,
) -> Result<PersistedMessage, JobFailure> {
    ctx.db.insert_message(message).await.map_err(|e| JobFailure {
        stage: StageId::PersistMessage,
        kind: e.kind(ErrorKind::DbInsertMessage),
        reason: e.to_string(),
    })
}

/// S3: render the prompt from the category tables, then call the vision
/// model with every image attachment. Transport errors are retried (2
/// retries, exponential back-off); decode errors are not.
async fn extract(
    ctx: &PipelineContext,
    message: &Message,
) -> Result<serde_json::Value, JobFailure> {
    let stage_failure = |kind: ErrorKind, reason: String| JobFailure {
        stage: StageId::Extract,
        kind,
        reason,
    };

    let template = match &ctx.config.llm.prompt_template {
        Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            stage_failure(ErrorKind::LlmTransport, format!("prompt template {path}: {e}"))
        })?,
        None => DEFAULT_TEMPLATE.to_string(),
    };

    let prompt = tickd_extract::prompt::render_from_db(&ctx.db, &template)
        .await
        .map_err(|e| stage_failure(e.kind(ErrorKind::DbConnect), e.to_string()))?;

    let mut extraction = ExtractionRequest::new();
    extraction.add_text(prompt);
    for attachment in message.image_attachments() {
        if let Some(path) = &attachment.path {
            extraction
                .add_image_file(Path::new(path))
                .await
                .map_err(|e| stage_failure(e.kind(), e.to_string()))?;
        }
    }

    let llm = Arc::clone(&ctx.llm);
    RetryPolicy::llm_transport()
        .run(
            |e: &tickd_extract::ExtractError| e.kind().is_retryable(),
            || llm.call_json(&extraction),
        )
        .await
        .map_err(|e| stage_failure(e.kind(), e.to_string()))
}

/// S4: pure transform of the extraction into the relational aggregate.
fn transform(extraction: &serde_json::Value, message_id: i64) -> Result<ReceiptData, JobFailure> {
    tickd_transform::transform_receipt(extraction, Some(message_id)).map_err(|e| JobFailure {
        stage: StageId::Transform,
        kind: e.kind(),
        reason: e.to_string(),
    })
}

/// S5: persist the aggregate, linking the attachments persisted in S2.
async fn persist_receipt(
    ctx: &PipelineContext,
    receipt: &ReceiptData,
    persisted: &PersistedMessage,
) -> Result<ReceiptSummary, JobFailure> {
    let transaction_id = ctx
        .db
        .insert_receipt(
            receipt,
            Some(persisted.message_id),
            Some(&persisted.attachment_ids),
        )
        .await
        .map_err(|e| JobFailure {
            stage: StageId::PersistReceipt,
            kind: e.kind(ErrorKind::DbInsertReceipt),
            reason: e.to_string(),
        })?;

    Ok(ReceiptSummary {
        transaction_id,
        store_name: receipt.store.store_name.clone(),
        total: receipt.transaction.total,
        currency: receipt.transaction.currency.clone(),
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tickd_sensor::AttachmentTag;

    fn tags_with_attachment(path: &str) -> RunTags {
        RunTags {
            message_timestamp: "2024-11-14T18:00:00.123".into(),
            sender_uuid: "11112222-3333-4444-5555-666677778888".into(),
            sender_number: "+41797654321".into(),
            sender_name: "Alice".into(),
            group_id: "G1".into(),
            group_name: "Tickets".into(),
            attachment_paths: serde_json::to_string(&[AttachmentTag {
                path: path.to_string(),
                content_type: "image/jpeg".into(),
                filename: "r.jpg".into(),
                id: "A1".into(),
            }])
            .unwrap(),
            message_text: "ticket".into(),
            is_group_message: true,
            test_mode: false,
        }
    }

    #[test]
    fn reconstructs_from_tags_when_the_file_exists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"jpeg bytes").unwrap();
        let tags = tags_with_attachment(file.path().to_str().unwrap());

        let message = reconstruct_message(&tags).unwrap();
        assert_eq!(message.sender.name.as_deref(), Some("Alice"));
        assert_eq!(message.group.as_ref().unwrap().id, "G1");
        assert!(message.is_group_message);
        assert_eq!(message.attachments.len(), 1);
        assert!(message.has_image_attachment());
        assert_eq!(
            message.timestamp,
            chrono::NaiveDate::from_ymd_opt(2024, 11, 14)
                .unwrap()
                .and_hms_milli_opt(18, 0, 0, 123)
                .unwrap()
        );
    }

    #[test]
    fn missing_file_on_disk_fails_the_reconstruction() {
        let tags = tags_with_attachment("/nonexistent/tickd/A1");
        let failure = reconstruct_message(&tags).unwrap_err();
        assert_eq!(failure.stage, StageId::ReconstructMessage);
        assert_eq!(failure.kind, ErrorKind::SidecarParse);
    }

    #[test]
    fn unparsable_timestamp_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let mut tags = tags_with_attachment(file.path().to_str().unwrap());
        tags.message_timestamp = "yesterday evening".into();
        let failure = reconstruct_message(&tags).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SidecarParse);
    }

    #[test]
    fn timestamp_with_utc_suffix_is_normalised_to_local() {
        let raw = "2024-11-14T17:00:00Z";
        let parsed = parse_tag_timestamp(raw).unwrap();
        let expected = DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn timestamp_without_fraction_is_accepted() {
        assert!(parse_tag_timestamp("2024-11-14T18:00:00").is_some());
    }

    #[test]
    fn empty_tag_fields_become_none() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let mut tags = tags_with_attachment(file.path().to_str().unwrap());
        tags.sender_name = String::new();
        tags.group_id = String::new();
        tags.message_text = String::new();
        tags.is_group_message = false;

        let message = reconstruct_message(&tags).unwrap();
        assert!(message.sender.name.is_none());
        assert!(message.group.is_none());
        assert!(message.text.is_none());
    }

    #[test]
    fn non_image_survivor_is_not_enough() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF").unwrap();
        let mut tags = tags_with_attachment(file.path().to_str().unwrap());
        tags.attachment_paths = serde_json::to_string(&[AttachmentTag {
            path: file.path().to_string_lossy().into_owned(),
            content_type: "application/pdf".into(),
            filename: "scan.pdf".into(),
            id: "A1".into(),
        }])
        .unwrap();

        let failure = reconstruct_message(&tags).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SidecarParse);
        assert!(failure.reason.contains("no image attachment"));
    }
}

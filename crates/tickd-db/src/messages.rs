//! Message-side persistence: senders, groups, inbound messages and their
//! attachments.

use chrono::NaiveDateTime;
use sqlx::PgExecutor;
use tracing::{debug, info};

use tickd_core::Message;

use crate::error::{is_unique_violation, Result};
use crate::pool::Db;

/// Ids handed to the rest of the pipeline after a message insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub message_id: i64,
    pub attachment_ids: Vec<i64>,
}

impl Db {
    /// Insert or refresh a sender keyed on its Signal UUID.
    ///
    /// Existing non-null number/name win when the new observation lacks them;
    /// `last_seen` is always touched.
    pub async fn upsert_sender(
        &self,
        uuid: &str,
        number: Option<&str>,
        name: Option<&str>,
    ) -> Result<i64> {
        upsert_sender(self.pool(), uuid, number, name).await
    }

    /// Insert or rename a group keyed on its opaque Signal id.
    pub async fn upsert_group(&self, signal_group_id: &str, name: &str) -> Result<i64> {
        upsert_group(self.pool(), signal_group_id, name).await
    }

    /// True when a message with this `(sender uuid, timestamp)` pair is
    /// already persisted — the sensor's dedup probe.
    pub async fn message_exists(
        &self,
        sender_uuid: &str,
        timestamp: NaiveDateTime,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1
                FROM signal_message m
                JOIN signal_sender s ON m.sender_id = s.sender_id
                WHERE m.timestamp = $1
                  AND s.signal_uuid = $2
            )",
        )
        .bind(timestamp)
        .bind(sender_uuid)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    /// Look up an already-persisted message and its attachment ids by the
    /// natural key. Used to resolve idempotence hits.
    pub async fn find_message(
        &self,
        sender_uuid: &str,
        timestamp: NaiveDateTime,
    ) -> Result<Option<PersistedMessage>> {
        let message_id: Option<i64> = sqlx::query_scalar(
            "SELECT m.message_id
             FROM signal_message m
             JOIN signal_sender s ON m.sender_id = s.sender_id
             WHERE m.timestamp = $1
               AND s.signal_uuid = $2
             ORDER BY m.message_id DESC
             LIMIT 1",
        )
        .bind(timestamp)
        .bind(sender_uuid)
        .fetch_optional(self.pool())
        .await?;

        let Some(message_id) = message_id else {
            return Ok(None);
        };
        let attachment_ids = self.attachment_ids_for_message(message_id).await?;
        Ok(Some(PersistedMessage {
            message_id,
            attachment_ids,
        }))
    }

    pub async fn attachment_ids_for_message(&self, message_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT attachment_id
             FROM message_attachment_mapping
             WHERE message_id = $1
             ORDER BY attachment_id",
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Persist one inbound message: sender/group upserts, the message row,
    /// one attachment row per attachment, and the mapping rows — all in one
    /// transaction.
    ///
    /// A duplicate `(sender, timestamp)` pair is an idempotence hit: the
    /// existing row's ids are returned instead of an error.
    pub async fn insert_message(&self, message: &Message) -> Result<PersistedMessage> {
        let mut tx = self.pool().begin().await?;

        let sender_id = match message.sender.uuid.as_deref() {
            Some(uuid) => Some(
                upsert_sender(
                    &mut *tx,
                    uuid,
                    message.sender.number.as_deref(),
                    message.sender.name.as_deref(),
                )
                .await?,
            ),
            None => None,
        };

        let group_id = match (&message.group, message.is_group_message) {
            (Some(group), true) => Some(upsert_group(&mut *tx, &group.id, &group.name).await?),
            _ => None,
        };

        let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO signal_message (
                sender_id, group_id, timestamp, text_content,
                is_group_message, signal_account
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING message_id",
        )
        .bind(sender_id)
        .bind(group_id)
        .bind(message.timestamp)
        .bind(message.text.as_deref())
        .bind(message.is_group_message)
        .bind(message.account.clone().unwrap_or_default())
        .fetch_one(&mut *tx)
        .await;

        let message_id = match inserted {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                // Already persisted by an earlier run — surface the existing
                // row instead of failing the stage.
                tx.rollback().await.ok();
                if let Some(uuid) = message.sender.uuid.as_deref() {
                    if let Some(existing) = self.find_message(uuid, message.timestamp).await? {
                        info!(
                            message_id = existing.message_id,
                            "duplicate message insert resolved to existing row"
                        );
                        return Ok(existing);
                    }
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut attachment_ids = Vec::with_capacity(message.attachments.len());
        for att in &message.attachments {
            let attachment_id: i64 = sqlx::query_scalar(
                "INSERT INTO attachment (
                    signal_attachment_id, content_type,
                    filename, file_size, upload_timestamp_ms, file_path
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING attachment_id",
            )
            .bind(&att.id)
            .bind(&att.content_type)
            .bind(&att.filename)
            .bind(att.size)
            .bind(att.upload_timestamp_ms)
            .bind(att.path.as_deref())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO message_attachment_mapping (message_id, attachment_id)
                 VALUES ($1, $2)",
            )
            .bind(message_id)
            .bind(attachment_id)
            .execute(&mut *tx)
            .await?;

            attachment_ids.push(attachment_id);
        }

        tx.commit().await?;
        debug!(
            message_id,
            attachments = attachment_ids.len(),
            "signal message persisted"
        );
        Ok(PersistedMessage {
            message_id,
            attachment_ids,
        })
    }
}

async fn upsert_sender<'e, E: PgExecutor<'e>>(
    executor: E,
    uuid: &str,
    number: Option<&str>,
    name: Option<&str>,
) -> Result<i64> {
    let sender_id: i64 = sqlx::query_scalar(
        "INSERT INTO signal_sender (signal_uuid, phone_number, contact_name, last_seen)
         VALUES ($1, $2, $3, CURRENT_TIMESTAMP)
         ON CONFLICT (signal_uuid)
         DO UPDATE SET
             phone_number = COALESCE(EXCLUDED.phone_number, signal_sender.phone_number),
             contact_name = COALESCE(EXCLUDED.contact_name, signal_sender.contact_name),
             last_seen = CURRENT_TIMESTAMP
         RETURNING sender_id",
    )
    .bind(uuid)
    .bind(number)
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(sender_id)
}

async fn upsert_group<'e, E: PgExecutor<'e>>(
    executor: E,
    signal_group_id: &str,
    name: &str,
) -> Result<i64> {
    let group_id: i64 = sqlx::query_scalar(
        "INSERT INTO signal_group (signal_group_id, group_name)
         VALUES ($1, $2)
         ON CONFLICT (signal_group_id)
         DO UPDATE SET group_name = EXCLUDED.group_name
         RETURNING group_id",
    )
    .bind(signal_group_id)
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(group_id)
}

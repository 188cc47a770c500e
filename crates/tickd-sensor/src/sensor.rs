//! The polling tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use tickd_core::config::SensorConfig;
use tickd_core::Message;
use tickd_db::Db;
use tickd_signal::envelope;
use tickd_signal::{SignalAdapter, SignalError};

use crate::request::JobRequest;
use crate::schedule;

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing to do; the reason is surfaced in logs.
    Skip(String),
    /// One job request per newly detected receipt message.
    Requests(Vec<JobRequest>),
}

/// Polls the sidecar and emits one [`JobRequest`] per new image-bearing
/// message. A single logical poller: ticks must not overlap, which the
/// daemon loop guarantees by awaiting each tick before scheduling the next.
pub struct SignalSensor {
    adapter: Arc<SignalAdapter>,
    db: Arc<Db>,
    max_messages: u32,
    interval: Duration,
    schedule_gated: bool,
    test_mode: bool,
}

impl SignalSensor {
    /// Production variant: schedule-gated, 20-minute interval.
    pub fn production(adapter: Arc<SignalAdapter>, db: Arc<Db>, cfg: &SensorConfig) -> Self {
        Self {
            adapter,
            db,
            max_messages: cfg.max_messages,
            interval: Duration::from_secs(cfg.interval_secs),
            schedule_gated: true,
            test_mode: false,
        }
    }

    /// Test variant: one-minute interval, no schedule gate, tagged runs.
    pub fn test_variant(adapter: Arc<SignalAdapter>, db: Arc<Db>, cfg: &SensorConfig) -> Self {
        Self {
            adapter,
            db,
            max_messages: cfg.max_messages.max(100),
            interval: Duration::from_secs(60),
            schedule_gated: false,
            test_mode: true,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One poll: receive → align → download → filter → dedup → emit.
    ///
    /// Only the sidecar `receive` propagates an error (retryable upstream);
    /// a failing dedup probe keeps the message — duplicates are preferred to
    /// loss, and the insert path still resolves them safely.
    pub async fn tick(&self) -> Result<TickOutcome, SignalError> {
        if self.schedule_gated && !schedule::is_within_schedule() {
            debug!(
                "sensor skip: {}",
                schedule::describe(Local::now().naive_local())
            );
            return Ok(TickOutcome::Skip("out of schedule".to_string()));
        }

        let raw = self.adapter.receive(self.max_messages).await?;
        if raw.trim().is_empty() {
            return Ok(TickOutcome::Skip("no new messages".to_string()));
        }

        // Keep raw lines addressable by (timestamp_ms, source) so accepted
        // messages can be traced back to their envelope in the logs.
        let raw_by_key: HashMap<(i64, Option<String>), &str> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|line| envelope::envelope_key(line).map(|key| (key, line)))
            .collect();

        let parsed = self.adapter.parse(&raw);
        debug!(
            raw_lines = raw_by_key.len(),
            parsed = parsed.len(),
            "receive batch parsed"
        );

        let downloaded = self.adapter.download_attachments(parsed).await;
        let with_images: Vec<Message> = downloaded
            .into_iter()
            .filter(Message::has_image_attachment)
            .collect();

        let mut requests = Vec::new();
        for message in &with_images {
            if self.is_duplicate(message).await {
                debug!(
                    sender = %message.sender,
                    timestamp = %message.timestamp,
                    "message already persisted, dropping"
                );
                continue;
            }

            let request = JobRequest::from_message(message, self.test_mode);
            // Envelope keys carry epoch millis; the parsed timestamp is naive
            // local, so convert it back through the local offset.
            let timestamp_ms = message
                .timestamp
                .and_local_timezone(Local)
                .single()
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_default();
            let key = (
                timestamp_ms,
                message
                    .sender
                    .uuid
                    .clone()
                    .or_else(|| message.sender.number.clone()),
            );
            debug!(
                run_key = %request.run_key,
                raw_seen = raw_by_key.contains_key(&key),
                "emitting job request"
            );
            requests.push(request);
        }

        if requests.is_empty() {
            return Ok(TickOutcome::Skip(
                "no new messages with receipt images".to_string(),
            ));
        }
        info!(count = requests.len(), "new receipt messages detected");
        Ok(TickOutcome::Requests(requests))
    }

    /// Fail-open dedup probe against the persisted messages.
    async fn is_duplicate(&self, message: &Message) -> bool {
        let Some(uuid) = message.sender.uuid.as_deref() else {
            // No UUID, no natural key — treat as new and let the insert-side
            // constraint sort it out.
            return false;
        };
        match self.db.message_exists(uuid, message.timestamp).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("dedup check failed, keeping message: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use tickd_core::config::SignalConfig;

    fn adapter(sidecar: &str) -> Arc<SignalAdapter> {
        Arc::new(SignalAdapter::new(&SignalConfig {
            phone_number: "+41791234567".into(),
            sidecar_path: sidecar.into(),
            attachment_dir: "/tmp/tickd-test-attachments".into(),
            default_group_id: None,
        }))
    }

    fn lazy_db() -> Arc<Db> {
        // Never actually connected — the ticks under test bail out before
        // touching the pool.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://user:pw@localhost:1/receipts")
            .unwrap();
        Arc::new(Db::from_pool(pool))
    }

    #[tokio::test]
    async fn empty_receive_batch_skips() {
        // `true` exits 0 with no output: an empty batch.
        let sensor = SignalSensor::test_variant(adapter("true"), lazy_db(), &SensorConfig::default());
        match sensor.tick().await.unwrap() {
            TickOutcome::Skip(reason) => assert_eq!(reason, "no new messages"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sidecar_failure_propagates() {
        let sensor = SignalSensor::test_variant(adapter("false"), lazy_db(), &SensorConfig::default());
        assert!(sensor.tick().await.is_err());
    }

    #[tokio::test]
    async fn non_envelope_output_skips_without_images() {
        // `echo` feeds back its own arguments — parseable as no envelope.
        let sensor = SignalSensor::test_variant(adapter("echo"), lazy_db(), &SensorConfig::default());
        match sensor.tick().await.unwrap() {
            TickOutcome::Skip(reason) => {
                assert_eq!(reason, "no new messages with receipt images")
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn variants_differ_only_in_gating_and_cadence() {
        let cfg = SensorConfig::default();
        let prod = SignalSensor::production(adapter("true"), lazy_db(), &cfg);
        let test = SignalSensor::test_variant(adapter("true"), lazy_db(), &cfg);
        assert_eq!(prod.interval(), Duration::from_secs(1200));
        assert_eq!(test.interval(), Duration::from_secs(60));
        assert!(prod.schedule_gated && !prod.test_mode);
        assert!(!test.schedule_gated && test.test_mode);
    }
}

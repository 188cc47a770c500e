//! Terminal-state observers.
//!
//! Observers fire once per terminal job — success XOR failure — which is
//! what keeps the user notification at-most-once regardless of how many
//! stages tripped over the same root cause. Notification failures are
//! logged and never promoted into job failures.

use std::sync::Arc;

use tracing::{info, warn};

use tickd_sensor::RunTags;
use tickd_signal::SignalAdapter;

use crate::engine::JobOutcome;

/// Callback invoked once when a job reaches SUCCESS or FAILURE.
#[async_trait::async_trait]
pub trait TerminalObserver: Send + Sync {
    async fn on_terminal(&self, outcome: &JobOutcome);
}

/// Longest failure reason carried into a notification.
const MAX_REASON_CHARS: usize = 200;

/// Sends the user-facing Signal message for each terminal job.
pub struct SignalNotifier {
    signal: Arc<SignalAdapter>,
    default_group_id: Option<String>,
}

impl SignalNotifier {
    pub fn new(signal: Arc<SignalAdapter>, default_group_id: Option<String>) -> Self {
        Self {
            signal,
            default_group_id,
        }
    }
}

#[async_trait::async_trait]
impl TerminalObserver for SignalNotifier {
    async fn on_terminal(&self, outcome: &JobOutcome) {
        let text = match &outcome.result {
            Ok(summary) => format!(
                "{} ✅ Ticket traité avec succès — {} — {} {}",
                mention(&outcome.tags),
                summary.store_name,
                summary.total,
                summary.currency
            ),
            Err(failure) => format!(
                "{} ❌ Échec du traitement du ticket — {}: {}",
                mention(&outcome.tags),
                failure.kind,
                truncate_reason(&failure.reason, MAX_REASON_CHARS)
            ),
        };

        let Some(group_id) = target_group(&outcome.tags, self.default_group_id.as_deref()) else {
            warn!(
                run_key = %outcome.run_key,
                "no group id in tags and no default configured, dropping notification"
            );
            return;
        };

        // Fire-and-forget: the adapter logs send failures itself.
        self.signal.send_to_group(&group_id, &text).await;
        info!(run_key = %outcome.run_key, group_id = %group_id, "notification sent");
    }
}

/// Group resolution: the run's own group id, else the configured default.
fn target_group(tags: &RunTags, default_group_id: Option<&str>) -> Option<String> {
    let from_tags = tags.group_id.trim();
    if !from_tags.is_empty() {
        return Some(from_tags.to_string());
    }
    default_group_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Uploader mention, best identity first: first name, else the last 4
/// digits of the number, else a short UUID prefix, else the generic handle.
pub fn mention(tags: &RunTags) -> String {
    let name = tags.sender_name.trim();
    if !name.is_empty() && !matches!(name.to_lowercase().as_str(), "unknown" | "none") {
        let first = name.split_whitespace().next().unwrap_or(name);
        return format!("@{first}");
    }

    let number = tags.sender_number.trim();
    if !number.is_empty() {
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 4 {
            return format!("@{}", &digits[digits.len() - 4..]);
        }
        return format!("@{number}");
    }

    let uuid = tags.sender_uuid.trim();
    if !uuid.is_empty() {
        let prefix: String = uuid.chars().take(8).collect();
        return format!("@{prefix}");
    }

    "@utilisateur".to_string()
}

/// Char-boundary-safe truncation with an ellipsis marker.
pub fn truncate_reason(reason: &str, max_chars: usize) -> String {
    if reason.chars().count() <= max_chars {
        return reason.to_string();
    }
    let cut: String = reason.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}…")
}

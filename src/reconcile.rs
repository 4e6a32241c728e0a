//! Webhook reconciliation
//!
//! Single funnel for everything learned about a call after it was placed:
//! webhook deliveries and monitor status polls both land here. Writes are
//! field-level and idempotent, so duplicated or reordered deliveries
//! converge on the same record instead of clobbering each other.

use std::sync::Arc;

use thiserror::Error;

use crate::db::CallRepository;
use crate::models::CallRecord;
use crate::providers::CallUpdate;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct WebhookReconciler {
    calls: Arc<dyn CallRepository>,
}

impl WebhookReconciler {
    pub fn new(calls: Arc<dyn CallRepository>) -> Self {
        Self { calls }
    }

    /// Apply one observation to the call record. Returns the record as of
    /// the last write, or `None` when the call id is unknown here; unknown
    /// calls are logged and dropped, never an error to the caller.
    pub async fn apply(&self, update: &CallUpdate) -> Result<Option<CallRecord>, ReconcileError> {
        let Some(mut record) = self.calls.get_by_call_id(&update.call_id).await? else {
            tracing::warn!("update for unknown call {}, ignoring", update.call_id);
            return Ok(None);
        };

        if update.is_empty() {
            return Ok(Some(record));
        }

        if let Some(status) = update.status {
            match self.calls.update_status(&update.call_id, status).await? {
                Some(updated) => {
                    if updated.status != record.status {
                        tracing::info!(
                            "call {} status {} -> {}",
                            update.call_id,
                            record.status.display_name(),
                            updated.status.display_name()
                        );
                    }
                    record = updated;
                }
                None => {
                    tracing::debug!(
                        "dropping stale status {} for finished call {}",
                        status.display_name(),
                        update.call_id
                    );
                }
            }
        }

        if let Some(url) = &update.recording_url {
            let normalized = normalize_recording_url(url);
            if let Some(updated) = self
                .calls
                .update_recording(&update.call_id, &normalized)
                .await?
            {
                record = updated;
            }
        }

        if let Some(turns) = &update.transcript {
            let value = serde_json::to_value(turns)?;
            if let Some(updated) = self
                .calls
                .update_transcript(&update.call_id, &value)
                .await?
            {
                record = updated;
            }
        }

        if let Some(analysis) = &update.analysis {
            if let Some(updated) = self
                .calls
                .update_analysis(&update.call_id, analysis)
                .await?
            {
                record = updated;
            }
        }

        Ok(Some(record))
    }
}

const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "ogg", "flac", "m4a"];

/// Provider recording URLs are not always fetchable as audio. Twilio's
/// canonical recording URL carries no extension and serves mp3 once one is
/// appended; URLs that already name an audio file pass through untouched.
fn normalize_recording_url(raw: &str) -> String {
    let Ok(parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    // Appending to a URL with a query string would corrupt it.
    if parsed.query().is_some() {
        return raw.to_string();
    }
    let has_audio_extension = parsed
        .path()
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if has_audio_extension {
        raw.to_string()
    } else {
        format!("{}.mp3", raw)
    }
}

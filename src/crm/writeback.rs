//! Call summary writeback
//!
//! Turns a finished call record into a short plain-text note on the CRM
//! project. Summaries are assembled from fields we already store; no
//! generated content.

use std::sync::Arc;

use crate::crm::CrmProvider;
use crate::models::CallRecord;

pub struct CrmWriteback {
    crm: Option<Arc<dyn CrmProvider>>,
}

impl CrmWriteback {
    pub fn new(crm: Option<Arc<dyn CrmProvider>>) -> Self {
        Self { crm }
    }

    pub fn enabled(&self) -> bool {
        self.crm.is_some()
    }

    /// Push a finished call's summary to the CRM. Failures are logged and
    /// swallowed; call state never depends on the CRM answering.
    pub async fn record_call(&self, record: &CallRecord) {
        let Some(crm) = &self.crm else {
            tracing::debug!("no crm configured, skipping writeback for {}", record.call_id);
            return;
        };
        let Some(project_id) = &record.project_id else {
            tracing::debug!("call {} has no project, skipping writeback", record.call_id);
            return;
        };
        if record.status.is_active() {
            tracing::warn!(
                "refusing writeback for still-active call {}",
                record.call_id
            );
            return;
        }

        let summary = build_summary(record);
        match crm.update_project(project_id, &summary).await {
            Ok(()) => tracing::info!(
                "wrote call {} summary to {} project {}",
                record.call_id,
                crm.kind().display_name(),
                project_id
            ),
            Err(e) => tracing::warn!("crm writeback for call {} failed: {}", record.call_id, e),
        }
    }
}

fn build_summary(record: &CallRecord) -> String {
    let mut lines = vec![format!(
        "{} call to {}: {}",
        record.provider.display_name(),
        record.phone_number,
        record.status.display_name()
    )];
    if let Some(seconds) = record.duration_seconds() {
        lines.push(format!("Duration: {}m {}s", seconds / 60, seconds % 60));
    }
    if let Some(turns) = record.transcript.as_ref().and_then(|t| t.as_array()) {
        lines.push(format!("Transcript: {} turns captured", turns.len()));
    }
    if let Some(summary) = record
        .analysis_data
        .as_ref()
        .and_then(|a| a.get("summary"))
        .and_then(|s| s.as_str())
    {
        lines.push(format!("Outcome: {}", summary));
    }
    if let Some(url) = &record.recording_url {
        lines.push(format!("Recording: {}", url));
    }
    lines.join("\n")
}

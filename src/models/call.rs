use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable call history row. One per provider call, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallRecord {
    pub id: i64,
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub provider: CallProvider,
    pub status: CallStatus,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "listenUrl")]
    pub listen_url: Option<String>,
    #[serde(rename = "recordingUrl")]
    pub recording_url: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "providerData")]
    pub provider_data: serde_json::Value,
    #[serde(rename = "analysisData")]
    pub analysis_data: Option<serde_json::Value>,
    pub transcript: Option<serde_json::Value>,
}

impl CallRecord {
    pub fn duration_seconds(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_seconds().max(0))
    }
}

/// The one call a user currently has in flight. Held in memory with a TTL,
/// cleared when the call reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCallSlot {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    pub provider: CallProvider,
    pub status: CallStatus,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "listenUrl")]
    pub listen_url: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "providerData")]
    pub provider_data: serde_json::Value,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "call_provider", rename_all = "PascalCase")]
pub enum CallProvider {
    Vapi,
    Twilio,
}

impl CallProvider {
    pub fn display_name(&self) -> &str {
        match self {
            CallProvider::Vapi => "Vapi",
            CallProvider::Twilio => "Twilio",
        }
    }
}

impl std::str::FromStr for CallProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vapi" => Ok(CallProvider::Vapi),
            "twilio" => Ok(CallProvider::Twilio),
            other => Err(format!("unknown voice provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "call_status", rename_all = "PascalCase")]
pub enum CallStatus {
    Queued,
    Ringing,
    InProgress,
    Forwarding,
    Ended,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

impl CallStatus {
    pub fn display_name(&self) -> &str {
        match self {
            CallStatus::Queued => "Queued",
            CallStatus::Ringing => "Ringing",
            CallStatus::InProgress => "In Progress",
            CallStatus::Forwarding => "Forwarding",
            CallStatus::Ended => "Completed",
            CallStatus::Busy => "Busy",
            CallStatus::NoAnswer => "No Answer",
            CallStatus::Failed => "Failed",
            CallStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Failed
                | CallStatus::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One utterance in a call transcript, stored as JSONB on the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptTurn {
    pub role: String,
    pub message: String,
    #[serde(rename = "secondsFromStart")]
    pub seconds_from_start: Option<f64>,
}

/// Insert payload for a freshly placed call. `started_at` and `is_active`
/// are filled by the store.
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub user_id: i64,
    pub project_id: Option<String>,
    pub call_id: String,
    pub provider: CallProvider,
    pub status: CallStatus,
    pub phone_number: String,
    pub listen_url: Option<String>,
    pub provider_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallRequest {
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    #[serde(rename = "customerName")]
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallResponse {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub status: CallStatus,
    pub provider: CallProvider,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCallResponse {
    pub success: bool,
}

//! Voice provider adapters
//!
//! Everything above this module reasons about one provider-assigned call id
//! per call; the adapters absorb whatever shape the provider actually has
//! (Vapi dials a single leg, Twilio bridges two legs through a conference).

pub mod twilio;
pub mod vapi;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::config::{Settings, VoiceProviderSettings};
use crate::models::{CallProvider, CallStatus, TranscriptTurn};

pub use twilio::TwilioProvider;
pub use vapi::VapiProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("call {0} not found at provider")]
    NotFound(String),
    #[error("bad provider payload: {0}")]
    Parse(String),
}

/// Turn a non-success provider response into an error that keeps the
/// provider's own status code and message.
pub(crate) async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ProviderError::Api { status, message }
}

/// What the lifecycle service hands the adapter to place a call.
#[derive(Debug, Clone)]
pub struct ProviderCallRequest {
    pub user_id: i64,
    pub phone_number: String,
    /// The user's verified outbound caller id.
    pub caller_number: String,
    pub customer_name: Option<String>,
}

/// A successfully placed call, before anything is persisted.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub call_id: String,
    pub status: CallStatus,
    pub listen_url: Option<String>,
    pub provider_data: serde_json::Value,
}

/// One observation about a call, from a webhook delivery or a status poll.
/// Absent fields mean "no news", so applying updates out of order converges.
#[derive(Debug, Clone, Default)]
pub struct CallUpdate {
    pub call_id: String,
    pub status: Option<CallStatus>,
    pub recording_url: Option<String>,
    pub transcript: Option<Vec<TranscriptTurn>>,
    pub analysis: Option<serde_json::Value>,
}

impl CallUpdate {
    pub fn status(call_id: impl Into<String>, status: CallStatus) -> Self {
        Self {
            call_id: call_id.into(),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.recording_url.is_none()
            && self.transcript.is_none()
            && self.analysis.is_none()
    }
}

#[async_trait::async_trait]
pub trait VoiceProvider: Send + Sync {
    fn kind(&self) -> CallProvider;

    /// Place the outbound call. Never retried by callers: a timed-out
    /// request may still have dialed the customer, and a second attempt
    /// would ring them twice.
    async fn create_outbound_call(
        &self,
        req: &ProviderCallRequest,
    ) -> Result<ProviderCall, ProviderError>;

    /// Current provider-side view of the call.
    async fn get_call_status(&self, call_id: &str) -> Result<CallUpdate, ProviderError>;

    /// Best-effort teardown. `false` means the provider no longer knows the
    /// call. The authoritative end still arrives over the webhook.
    async fn end_call(&self, call_id: &str) -> Result<bool, ProviderError>;

    /// Authenticity check, run before anything is parsed or written.
    /// `request_url` is the externally visible URL the provider posted to;
    /// Twilio signs it, Vapi ignores it.
    fn verify_webhook(&self, request_url: &str, headers: &HeaderMap, body: &[u8]) -> bool;

    /// Translate a verified delivery into a call update.
    async fn parse_webhook(&self, headers: &HeaderMap, body: &[u8])
        -> Result<CallUpdate, ProviderError>;
}

/// Pick the adapter once at startup. Per-call dispatch goes through the
/// trait object; nothing re-reads the environment after this.
pub fn build_voice_provider(settings: &Settings) -> Arc<dyn VoiceProvider> {
    match &settings.voice_provider {
        VoiceProviderSettings::Vapi(cfg) => Arc::new(VapiProvider::new(
            cfg.api_key.clone(),
            cfg.assistant_id.clone(),
            cfg.phone_number_id.clone(),
            cfg.webhook_secret.clone(),
            settings.voice_webhook_url(),
        )),
        VoiceProviderSettings::Twilio(cfg) => Arc::new(TwilioProvider::new(
            cfg.account_sid.clone(),
            cfg.auth_token.clone(),
            settings.voice_webhook_url(),
        )),
    }
}

//! Vapi voice API client
//!
//! Direct-dial adapter: one outbound leg, placed and observed through Vapi's
//! JSON REST API. Live listen/control URLs come from the call's monitor
//! object; webhook authenticity is a shared secret header.

use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::models::{CallProvider, CallStatus, TranscriptTurn};
use crate::providers::{
    api_error, CallUpdate, ProviderCall, ProviderCallRequest, ProviderError, VoiceProvider,
};

#[derive(Clone)]
pub struct VapiProvider {
    client: Client,
    api_key: String,
    assistant_id: String,
    phone_number_id: String,
    webhook_secret: String,
    webhook_url: String,
    base_url: String,
}

impl VapiProvider {
    pub fn new(
        api_key: String,
        assistant_id: String,
        phone_number_id: String,
        webhook_secret: String,
        webhook_url: String,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            assistant_id,
            phone_number_id,
            webhook_secret,
            webhook_url,
            base_url: "https://api.vapi.ai".to_string(),
        }
    }

    async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response.json().await?)
    }

    async fn get_call(&self, call_id: &str) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .client
            .get(format!("{}/call/{}", self.base_url, call_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(call_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response.json().await?)
    }

    fn update_from_call(&self, call_id: &str, call: VapiCall) -> CallUpdate {
        let recording_url = call
            .recording_url
            .or_else(|| call.artifact.as_ref().and_then(|a| a.recording_url.clone()));
        let transcript = call
            .artifact
            .and_then(|a| a.messages)
            .and_then(turns_from_messages);

        CallUpdate {
            call_id: call_id.to_string(),
            status: call
                .status
                .as_deref()
                .map(|s| map_status(s, call.ended_reason.as_deref())),
            recording_url,
            transcript,
            analysis: call.analysis,
        }
    }
}

#[async_trait::async_trait]
impl VoiceProvider for VapiProvider {
    fn kind(&self) -> CallProvider {
        CallProvider::Vapi
    }

    async fn create_outbound_call(
        &self,
        req: &ProviderCallRequest,
    ) -> Result<ProviderCall, ProviderError> {
        let body = CreateCallBody {
            assistant_id: &self.assistant_id,
            phone_number_id: &self.phone_number_id,
            customer: CustomerRef {
                number: &req.phone_number,
                name: req.customer_name.as_deref(),
            },
            assistant_overrides: AssistantOverrides {
                server: ServerRef {
                    url: &self.webhook_url,
                },
            },
        };

        let raw = self.post("/call", &body).await?;
        let call: VapiCall =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let status = call
            .status
            .as_deref()
            .map(|s| map_status(s, None))
            .unwrap_or(CallStatus::Queued);

        Ok(ProviderCall {
            call_id: call.id,
            status,
            listen_url: call.monitor.and_then(|m| m.listen_url),
            provider_data: raw,
        })
    }

    async fn get_call_status(&self, call_id: &str) -> Result<CallUpdate, ProviderError> {
        let raw = self.get_call(call_id).await?;
        let call: VapiCall =
            serde_json::from_value(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(self.update_from_call(call_id, call))
    }

    async fn end_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        let raw = match self.get_call(call_id).await {
            Ok(raw) => raw,
            Err(ProviderError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let call: VapiCall =
            serde_json::from_value(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let already_over = call
            .status
            .as_deref()
            .map(|s| map_status(s, call.ended_reason.as_deref()).is_terminal())
            .unwrap_or(false);
        if already_over {
            return Ok(true);
        }

        let Some(control_url) = call.monitor.and_then(|m| m.control_url) else {
            return Ok(false);
        };

        let response = self
            .client
            .post(&control_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "type": "end-call" }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(true)
    }

    fn verify_webhook(&self, _request_url: &str, headers: &HeaderMap, _body: &[u8]) -> bool {
        headers
            .get("x-vapi-secret")
            .map(|value| value.as_bytes() == self.webhook_secret.as_bytes())
            .unwrap_or(false)
    }

    async fn parse_webhook(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<CallUpdate, ProviderError> {
        let envelope: VapiWebhookEnvelope =
            serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let msg = envelope.message;

        let call_id = msg
            .call
            .map(|c| c.id)
            .ok_or_else(|| ProviderError::Parse("webhook has no call id".to_string()))?;

        let mut update = CallUpdate {
            call_id,
            ..Default::default()
        };

        match msg.kind.as_str() {
            "status-update" => {
                update.status = msg
                    .status
                    .as_deref()
                    .map(|s| map_status(s, msg.ended_reason.as_deref()));
            }
            "end-of-call-report" => {
                update.status = Some(map_ended_reason(msg.ended_reason.as_deref()));
                update.recording_url = msg
                    .recording_url
                    .or_else(|| msg.artifact.as_ref().and_then(|a| a.recording_url.clone()));
                update.transcript = msg
                    .artifact
                    .and_then(|a| a.messages)
                    .and_then(turns_from_messages);
                update.analysis = msg.analysis;
            }
            other => {
                // Speech updates, transcripts-in-progress, tool calls: not
                // ours to track.
                tracing::debug!("ignoring vapi webhook type '{}'", other);
            }
        }

        Ok(update)
    }
}

fn map_status(status: &str, ended_reason: Option<&str>) -> CallStatus {
    match status {
        "queued" => CallStatus::Queued,
        "ringing" => CallStatus::Ringing,
        "in-progress" => CallStatus::InProgress,
        "forwarding" => CallStatus::Forwarding,
        "ended" => map_ended_reason(ended_reason),
        other => {
            tracing::warn!("unmapped vapi call status '{}', treating as failed", other);
            CallStatus::Failed
        }
    }
}

fn map_ended_reason(reason: Option<&str>) -> CallStatus {
    let Some(reason) = reason else {
        return CallStatus::Ended;
    };
    if reason.contains("busy") {
        CallStatus::Busy
    } else if reason.contains("no-answer") || reason.contains("did-not-answer") {
        CallStatus::NoAnswer
    } else if reason.contains("error") || reason.contains("failed") {
        CallStatus::Failed
    } else {
        CallStatus::Ended
    }
}

fn turns_from_messages(messages: Vec<VapiMessage>) -> Option<Vec<TranscriptTurn>> {
    let turns: Vec<TranscriptTurn> = messages
        .into_iter()
        .filter_map(|m| match (m.role, m.message) {
            (Some(role), Some(message)) if role != "system" => Some(TranscriptTurn {
                role,
                message,
                seconds_from_start: m.seconds_from_start,
            }),
            _ => None,
        })
        .collect();
    if turns.is_empty() {
        None
    } else {
        Some(turns)
    }
}

// Request/Response types

#[derive(Serialize)]
struct CreateCallBody<'a> {
    #[serde(rename = "assistantId")]
    assistant_id: &'a str,
    #[serde(rename = "phoneNumberId")]
    phone_number_id: &'a str,
    customer: CustomerRef<'a>,
    #[serde(rename = "assistantOverrides")]
    assistant_overrides: AssistantOverrides<'a>,
}

#[derive(Serialize)]
struct CustomerRef<'a> {
    number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct AssistantOverrides<'a> {
    server: ServerRef<'a>,
}

#[derive(Serialize)]
struct ServerRef<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct VapiCall {
    id: String,
    status: Option<String>,
    #[serde(rename = "endedReason")]
    ended_reason: Option<String>,
    #[serde(rename = "recordingUrl")]
    recording_url: Option<String>,
    monitor: Option<VapiMonitor>,
    artifact: Option<VapiArtifact>,
    analysis: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct VapiMonitor {
    #[serde(rename = "listenUrl")]
    listen_url: Option<String>,
    #[serde(rename = "controlUrl")]
    control_url: Option<String>,
}

#[derive(Deserialize)]
struct VapiArtifact {
    #[serde(rename = "recordingUrl")]
    recording_url: Option<String>,
    messages: Option<Vec<VapiMessage>>,
}

#[derive(Deserialize)]
struct VapiMessage {
    role: Option<String>,
    message: Option<String>,
    #[serde(rename = "secondsFromStart")]
    seconds_from_start: Option<f64>,
}

// Webhook envelope

#[derive(Deserialize)]
struct VapiWebhookEnvelope {
    message: VapiWebhookMessage,
}

#[derive(Deserialize)]
struct VapiWebhookMessage {
    #[serde(rename = "type")]
    kind: String,
    call: Option<VapiCallRef>,
    status: Option<String>,
    #[serde(rename = "endedReason")]
    ended_reason: Option<String>,
    #[serde(rename = "recordingUrl")]
    recording_url: Option<String>,
    artifact: Option<VapiArtifact>,
    analysis: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct VapiCallRef {
    id: String,
}

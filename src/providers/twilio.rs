//! Twilio voice API client
//!
//! Conference-bridge adapter. One logical call is two Twilio legs (the
//! user's browser client and the customer's phone) dialed into a private
//! conference room; the recording hangs off the conference. The customer
//! leg's CallSid is the call id the rest of the system sees, and this
//! module keeps the correlation state that maps leg SIDs, conference names
//! and conference SIDs back to it when webhooks arrive.

use std::collections::{BTreeMap, HashMap};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Deserialize;
use sha1::Sha1;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{CallProvider, CallStatus};
use crate::providers::{
    api_error, CallUpdate, ProviderCall, ProviderCallRequest, ProviderError, VoiceProvider,
};

type HmacSha1 = Hmac<Sha1>;

/// How long correlation state for an ended conference is kept around.
/// Recording callbacks routinely land after conference-end.
const ENDED_SESSION_RETENTION_MINUTES: i64 = 60;

struct ConferenceSession {
    conference_name: String,
    customer_sid: String,
    agent_sid: Option<String>,
    conference_sid: Option<String>,
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CorrelationMap {
    /// Keyed by the canonical call id (customer leg SID).
    sessions: HashMap<String, ConferenceSession>,
    /// Any SID or conference name a webhook may carry, to canonical id.
    index: HashMap<String, String>,
}

impl CorrelationMap {
    fn insert_session(&mut self, session: ConferenceSession) {
        let canonical = session.customer_sid.clone();
        self.index.insert(session.customer_sid.clone(), canonical.clone());
        if let Some(agent_sid) = &session.agent_sid {
            self.index.insert(agent_sid.clone(), canonical.clone());
        }
        self.index
            .insert(session.conference_name.clone(), canonical.clone());
        self.sessions.insert(canonical, session);
    }

    fn resolve(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(String::as_str)
    }

    fn learn_conference_sid(&mut self, canonical: &str, conference_sid: &str) {
        if let Some(session) = self.sessions.get_mut(canonical) {
            if session.conference_sid.is_none() {
                session.conference_sid = Some(conference_sid.to_string());
            }
        }
        self.index
            .insert(conference_sid.to_string(), canonical.to_string());
    }

    fn mark_ended(&mut self, canonical: &str) {
        if let Some(session) = self.sessions.get_mut(canonical) {
            if session.ended_at.is_none() {
                session.ended_at = Some(Utc::now());
            }
        }
    }

    /// Drop sessions that ended long enough ago that no more callbacks are
    /// expected, along with their index entries.
    fn sweep(&mut self) {
        let cutoff = Utc::now() - Duration::minutes(ENDED_SESSION_RETENTION_MINUTES);
        self.sessions
            .retain(|_, s| s.ended_at.map(|t| t > cutoff).unwrap_or(true));
        let sessions = &self.sessions;
        self.index.retain(|_, canonical| sessions.contains_key(canonical));
    }
}

pub struct TwilioProvider {
    client: Client,
    account_sid: String,
    auth_token: String,
    webhook_url: String,
    recording_webhook_url: String,
    base_url: String,
    calls: RwLock<CorrelationMap>,
}

impl TwilioProvider {
    pub fn new(account_sid: String, auth_token: String, webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            account_sid,
            auth_token,
            recording_webhook_url: format!("{}/recording", webhook_url),
            webhook_url,
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
            calls: RwLock::new(CorrelationMap::default()),
        }
    }

    fn conference_twiml(&self, conference_name: &str) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<Response><Dial><Conference "#,
                r#"startConferenceOnEnter="true" endConferenceOnExit="true" "#,
                r#"record="record-from-start" recordingStatusCallback="{rec}" "#,
                r#"statusCallback="{cb}" statusCallbackEvent="start end join leave""#,
                r#">{name}</Conference></Dial></Response>"#
            ),
            rec = self.recording_webhook_url,
            cb = self.webhook_url,
            name = conference_name,
        )
    }

    async fn create_leg(
        &self,
        to: &str,
        from: &str,
        twiml: &str,
        with_status_callback: bool,
    ) -> Result<TwilioCall, ProviderError> {
        let mut form: Vec<(&str, &str)> = vec![("To", to), ("From", from), ("Twiml", twiml)];
        if with_status_callback {
            form.push(("StatusCallback", &self.webhook_url));
            form.push(("StatusCallbackMethod", "POST"));
            for event in ["initiated", "ringing", "answered", "completed"] {
                form.push(("StatusCallbackEvent", event));
            }
        }

        let response = self
            .client
            .post(format!(
                "{}/Accounts/{}/Calls.json",
                self.base_url, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response.json().await?)
    }

    /// Ask Twilio to complete (hang up) a single leg. `false` when the leg
    /// is unknown.
    async fn complete_leg(&self, sid: &str) -> Result<bool, ProviderError> {
        let response = self
            .client
            .post(format!(
                "{}/Accounts/{}/Calls/{}.json",
                self.base_url, self.account_sid, sid
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(true)
    }

    async fn parse_conference_event(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallUpdate, ProviderError> {
        let event = params
            .get("StatusCallbackEvent")
            .map(String::as_str)
            .unwrap_or_default();
        let conference_sid = params.get("ConferenceSid").map(String::as_str);
        let friendly_name = params.get("FriendlyName").map(String::as_str);

        let mut calls = self.calls.write().await;
        let canonical = conference_sid
            .and_then(|sid| calls.resolve(sid))
            .or_else(|| friendly_name.and_then(|name| calls.resolve(name)))
            .map(str::to_string);

        let Some(canonical) = canonical else {
            return Err(ProviderError::Parse(format!(
                "conference event '{}' for unknown conference",
                event
            )));
        };

        if let Some(sid) = conference_sid {
            calls.learn_conference_sid(&canonical, sid);
        }

        let mut update = CallUpdate {
            call_id: canonical.clone(),
            ..Default::default()
        };
        match event {
            // Both parties are bridged once the conference starts.
            "conference-start" => update.status = Some(CallStatus::InProgress),
            // The terminal status comes from the customer leg's own
            // callback; conference-end only schedules map cleanup.
            "conference-end" => calls.mark_ended(&canonical),
            _ => {}
        }
        Ok(update)
    }

    async fn parse_recording_event(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallUpdate, ProviderError> {
        let calls = self.calls.read().await;
        let canonical = params
            .get("ConferenceSid")
            .and_then(|sid| calls.resolve(sid))
            .or_else(|| params.get("CallSid").and_then(|sid| calls.resolve(sid)))
            .or_else(|| params.get("CallSid").map(String::as_str))
            .map(str::to_string);
        drop(calls);

        let Some(canonical) = canonical else {
            return Err(ProviderError::Parse(
                "recording callback without a resolvable call".to_string(),
            ));
        };

        let mut update = CallUpdate {
            call_id: canonical,
            ..Default::default()
        };
        let done = params
            .get("RecordingStatus")
            .map(|s| s == "completed")
            .unwrap_or(true);
        if done {
            update.recording_url = params.get("RecordingUrl").cloned();
        }
        Ok(update)
    }
}

#[async_trait::async_trait]
impl VoiceProvider for TwilioProvider {
    fn kind(&self) -> CallProvider {
        CallProvider::Twilio
    }

    async fn create_outbound_call(
        &self,
        req: &ProviderCallRequest,
    ) -> Result<ProviderCall, ProviderError> {
        let conference_name = format!("conf-{}", Uuid::new_v4());
        let twiml = self.conference_twiml(&conference_name);

        // Customer leg first; its SID is the canonical call id.
        let customer = self
            .create_leg(&req.phone_number, &req.caller_number, &twiml, true)
            .await?;

        let agent_identity = format!("client:user-{}", req.user_id);
        let agent = match self
            .create_leg(&agent_identity, &req.caller_number, &twiml, false)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                // Don't leave the customer's phone ringing into an empty
                // conference.
                if let Err(hangup_err) = self.complete_leg(&customer.sid).await {
                    tracing::warn!(
                        "failed to tear down customer leg {} after agent leg error: {}",
                        customer.sid,
                        hangup_err
                    );
                }
                return Err(e);
            }
        };

        let session = ConferenceSession {
            conference_name: conference_name.clone(),
            customer_sid: customer.sid.clone(),
            agent_sid: Some(agent.sid.clone()),
            conference_sid: None,
            ended_at: None,
        };
        self.calls.write().await.insert_session(session);

        tracing::info!(
            "twilio conference {} created: customer leg {}, agent leg {}",
            conference_name,
            customer.sid,
            agent.sid
        );

        Ok(ProviderCall {
            call_id: customer.sid.clone(),
            status: map_status(&customer.status),
            listen_url: None,
            provider_data: serde_json::json!({
                "conferenceName": conference_name,
                "customerSid": customer.sid,
                "agentSid": agent.sid,
            }),
        })
    }

    async fn get_call_status(&self, call_id: &str) -> Result<CallUpdate, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/Accounts/{}/Calls/{}.json",
                self.base_url, self.account_sid, call_id
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(call_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let call: TwilioCall = response.json().await?;
        Ok(CallUpdate::status(call_id, map_status(&call.status)))
    }

    async fn end_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        let agent_sid = {
            let calls = self.calls.read().await;
            calls
                .sessions
                .get(call_id)
                .and_then(|s| s.agent_sid.clone())
        };

        let ended = self.complete_leg(call_id).await?;
        if let Some(agent_sid) = agent_sid {
            if let Err(e) = self.complete_leg(&agent_sid).await {
                tracing::warn!("failed to complete agent leg {}: {}", agent_sid, e);
            }
        }
        Ok(ended)
    }

    fn verify_webhook(&self, request_url: &str, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(signature) = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Ok(expected) = STANDARD.decode(signature) else {
            return false;
        };

        // Twilio signs the callback URL with every form field appended in
        // alphabetical order, key then value, undecorated.
        let params: BTreeMap<String, String> =
            url::form_urlencoded::parse(body).into_owned().collect();
        let mut payload = request_url.to_string();
        for (key, value) in &params {
            payload.push_str(key);
            payload.push_str(value);
        }

        let Ok(mut mac) = HmacSha1::new_from_slice(self.auth_token.as_bytes()) else {
            return false;
        };
        mac.update(payload.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    async fn parse_webhook(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<CallUpdate, ProviderError> {
        self.calls.write().await.sweep();

        let params: BTreeMap<String, String> =
            url::form_urlencoded::parse(body).into_owned().collect();

        if params.contains_key("RecordingUrl") {
            return self.parse_recording_event(&params).await;
        }
        if params.contains_key("ConferenceSid") {
            return self.parse_conference_event(&params).await;
        }

        let Some(call_sid) = params.get("CallSid") else {
            return Err(ProviderError::Parse(
                "webhook without CallSid or ConferenceSid".to_string(),
            ));
        };

        let calls = self.calls.read().await;
        let canonical = calls
            .resolve(call_sid)
            .unwrap_or(call_sid.as_str())
            .to_string();
        drop(calls);

        let mut update = CallUpdate {
            call_id: canonical.clone(),
            ..Default::default()
        };
        // The browser leg's lifecycle is not the customer call's lifecycle.
        if canonical == *call_sid {
            update.status = params
                .get("CallStatus")
                .map(|status| map_status(status));
        }
        Ok(update)
    }
}

fn map_status(status: &str) -> CallStatus {
    match status {
        "queued" | "initiated" => CallStatus::Queued,
        "ringing" => CallStatus::Ringing,
        "in-progress" | "answered" => CallStatus::InProgress,
        "completed" => CallStatus::Ended,
        "busy" => CallStatus::Busy,
        "no-answer" => CallStatus::NoAnswer,
        "failed" => CallStatus::Failed,
        "canceled" => CallStatus::Canceled,
        other => {
            tracing::warn!("unmapped twilio call status '{}', treating as failed", other);
            CallStatus::Failed
        }
    }
}

// REST response types

#[derive(Deserialize)]
struct TwilioCall {
    sid: String,
    status: String,
}

//! Scriptable in-memory voice provider for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use reqwest::header::HeaderMap;
use tokio::sync::RwLock;

use crate::models::{CallProvider, CallStatus};
use crate::providers::{
    CallUpdate, ProviderCall, ProviderCallRequest, ProviderError, VoiceProvider,
};

pub struct MockVoiceProvider {
    next_id: AtomicU64,
    verify_ok: AtomicBool,
    created: RwLock<Vec<ProviderCallRequest>>,
    ended: RwLock<Vec<String>>,
    fail_create: RwLock<Option<ProviderError>>,
    snapshots: RwLock<HashMap<String, VecDeque<CallUpdate>>>,
    webhooks: RwLock<VecDeque<CallUpdate>>,
}

impl MockVoiceProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            verify_ok: AtomicBool::new(true),
            created: RwLock::new(Vec::new()),
            ended: RwLock::new(Vec::new()),
            fail_create: RwLock::new(None),
            snapshots: RwLock::new(HashMap::new()),
            webhooks: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn fail_next_create(&self, err: ProviderError) {
        *self.fail_create.write().await = Some(err);
    }

    pub fn set_verify(&self, ok: bool) {
        self.verify_ok.store(ok, Ordering::SeqCst);
    }

    /// Queue a snapshot for `get_call_status`. The last queued snapshot for
    /// a call keeps being returned once the queue drains.
    pub async fn push_snapshot(&self, call_id: &str, update: CallUpdate) {
        self.snapshots
            .write()
            .await
            .entry(call_id.to_string())
            .or_default()
            .push_back(update);
    }

    /// Queue the update the next `parse_webhook` call returns.
    pub async fn push_webhook(&self, update: CallUpdate) {
        self.webhooks.write().await.push_back(update);
    }

    pub async fn created_requests(&self) -> Vec<ProviderCallRequest> {
        self.created.read().await.clone()
    }

    pub async fn ended_calls(&self) -> Vec<String> {
        self.ended.read().await.clone()
    }
}

impl Default for MockVoiceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VoiceProvider for MockVoiceProvider {
    fn kind(&self) -> CallProvider {
        CallProvider::Vapi
    }

    async fn create_outbound_call(
        &self,
        req: &ProviderCallRequest,
    ) -> Result<ProviderCall, ProviderError> {
        if let Some(err) = self.fail_create.write().await.take() {
            return Err(err);
        }
        self.created.write().await.push(req.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderCall {
            call_id: format!("mock-call-{}", id),
            status: CallStatus::Queued,
            listen_url: Some(format!("wss://mock.example/listen/{}", id)),
            provider_data: serde_json::json!({ "mock": true }),
        })
    }

    async fn get_call_status(&self, call_id: &str) -> Result<CallUpdate, ProviderError> {
        let mut snapshots = self.snapshots.write().await;
        let Some(queue) = snapshots.get_mut(call_id) else {
            return Ok(CallUpdate::status(call_id, CallStatus::Queued));
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_default())
        } else {
            Ok(queue.front().cloned().unwrap_or_default())
        }
    }

    async fn end_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        self.ended.write().await.push(call_id.to_string());
        Ok(true)
    }

    fn verify_webhook(&self, _request_url: &str, _headers: &HeaderMap, _body: &[u8]) -> bool {
        self.verify_ok.load(Ordering::SeqCst)
    }

    async fn parse_webhook(
        &self,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> Result<CallUpdate, ProviderError> {
        self.webhooks
            .write()
            .await
            .pop_front()
            .ok_or_else(|| ProviderError::Parse("no scripted webhook".to_string()))
    }
}

//! Call lifecycle orchestration
//!
//! Single entry point for starting, fetching and ending a user's calls.
//! Side effects are ordered so the irreversible external call happens before
//! any internal write: a bookkeeping failure after the provider accepted the
//! call leaves a live call without records, which is logged loudly rather
//! than masked by a rollback that cannot hang up the phone.

use std::sync::Arc;

use crate::active_call::ActiveCallStore;
use crate::db::{CallRepository, UserRepository};
use crate::models::{
    ActiveCallSlot, CallRecord, CreateCallRequest, CreateCallResponse, EndCallResponse,
    NewCallRecord,
};
use crate::monitor::CallMonitor;
use crate::providers::{ProviderCallRequest, ProviderError, VoiceProvider};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("{0}")]
    Configuration(String),
    #[error("voice provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
}

pub struct CallManager {
    users: Arc<dyn UserRepository>,
    calls: Arc<dyn CallRepository>,
    active_calls: Arc<ActiveCallStore>,
    provider: Arc<dyn VoiceProvider>,
    monitor: CallMonitor,
}

impl CallManager {
    pub fn new(
        users: Arc<dyn UserRepository>,
        calls: Arc<dyn CallRepository>,
        active_calls: Arc<ActiveCallStore>,
        provider: Arc<dyn VoiceProvider>,
        monitor: CallMonitor,
    ) -> Self {
        Self {
            users,
            calls,
            active_calls,
            provider,
            monitor,
        }
    }

    pub async fn create_call(
        &self,
        user_id: i64,
        req: CreateCallRequest,
    ) -> Result<CreateCallResponse, CallError> {
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| CallError::NotFound(format!("user {}", user_id)))?;
        let caller_number = user.outbound_number.clone().ok_or_else(|| {
            CallError::Configuration(
                "no outbound number is configured for this account".to_string(),
            )
        })?;

        let phone_number = req.phone_number.trim().to_string();
        if phone_number.is_empty() {
            return Err(CallError::Configuration(
                "phone number is required".to_string(),
            ));
        }

        // The external call is the irreversible step; nothing is persisted
        // until the provider has accepted it, so a rejected call leaves no
        // orphan records.
        let request = ProviderCallRequest {
            user_id,
            phone_number: phone_number.clone(),
            caller_number,
            customer_name: req.customer_name.clone(),
        };
        let placed = self.provider.create_outbound_call(&request).await?;
        tracing::info!(
            "placed {} call {} to {} for user {}",
            self.provider.kind().display_name(),
            placed.call_id,
            phone_number,
            user_id
        );

        let record = match self
            .calls
            .insert(NewCallRecord {
                user_id,
                project_id: req.project_id.clone(),
                call_id: placed.call_id.clone(),
                provider: self.provider.kind(),
                status: placed.status,
                phone_number,
                listen_url: placed.listen_url.clone(),
                provider_data: placed.provider_data.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The phone call is live at the provider with no record of
                // it here. Nothing can roll that back; make it loud.
                tracing::error!(
                    "call {} is live at the provider but could not be persisted: {}",
                    placed.call_id,
                    e
                );
                return Err(e.into());
            }
        };

        // A new call supersedes whatever slot the user had.
        self.active_calls.set_from_record(&record).await;

        // Watching is best-effort; the call is already live and the
        // response has to say so either way.
        self.monitor.spawn(&record).await;

        Ok(CreateCallResponse {
            call_id: record.call_id,
            status: record.status,
            provider: record.provider,
            started_at: record.started_at,
        })
    }

    /// Fetch a call the user owns. Another user's call is reported as
    /// unknown rather than forbidden.
    pub async fn get_call(&self, user_id: i64, call_id: &str) -> Result<CallRecord, CallError> {
        match self.calls.get_by_call_id(call_id).await? {
            Some(record) if record.user_id == user_id => Ok(record),
            _ => Err(CallError::NotFound(format!("call {}", call_id))),
        }
    }

    /// Ask the provider to tear the call down. Fire-and-forget: the
    /// authoritative terminal state still arrives through webhooks or the
    /// monitor, so nothing is written here. Ending an already-ended call is
    /// a success.
    pub async fn end_call(
        &self,
        user_id: i64,
        call_id: &str,
    ) -> Result<EndCallResponse, CallError> {
        let record = self.get_call(user_id, call_id).await?;

        if record.status.is_terminal() {
            return Ok(EndCallResponse { success: true });
        }

        match self.provider.end_call(call_id).await {
            Ok(handled) => {
                if !handled {
                    tracing::debug!("provider had no live handle for call {}", call_id);
                }
            }
            Err(ProviderError::NotFound(_)) => {
                // Already gone on the provider side; the monitor's own poll
                // will fail the record if no webhook does.
                tracing::warn!("provider no longer knows call {}", call_id);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(EndCallResponse { success: true })
    }

    pub async fn active_call(&self, user_id: i64) -> Option<ActiveCallSlot> {
        self.active_calls.get(user_id).await
    }

    pub async fn list_recent_calls(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<CallRecord>, CallError> {
        Ok(self.calls.list_recent(user_id, limit.clamp(1, 100)).await?)
    }
}

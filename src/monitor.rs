//! Per-call monitor tasks
//!
//! Every placed call gets one cooperative task that watches it to the end:
//! it re-reads the call record (webhooks do the writing), occasionally asks
//! the provider directly in case a webhook got lost, and once the call is
//! terminal it clears the user's active slot and hands the record to the
//! CRM writeback. Tasks live in an explicit registry keyed by call id, so
//! they can be counted, cancelled, awaited and drained at shutdown; nothing
//! is spawned detached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::active_call::ActiveCallStore;
use crate::crm::CrmWriteback;
use crate::db::CallRepository;
use crate::models::{CallRecord, CallStatus};
use crate::providers::{CallUpdate, ProviderError, VoiceProvider};
use crate::reconcile::WebhookReconciler;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the call record is re-read.
    pub poll_interval: Duration,
    /// How often the provider itself is asked, as webhook-loss insurance.
    pub provider_poll_interval: Duration,
    /// Hard bound on how long a single call is watched.
    pub max_duration: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            provider_poll_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(4 * 3600),
        }
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of running monitor tasks, keyed by call id.
#[derive(Clone, Default)]
pub struct MonitorRegistry {
    monitors: Arc<RwLock<HashMap<String, MonitorHandle>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under a cancellation token and keep its handle. The entry
    /// removes itself when the task finishes.
    pub async fn spawn<F>(&self, call_id: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let registry = self.clone();
        let id = call_id.to_string();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = fut => {}
            }
            registry.monitors.write().await.remove(&id);
        });

        let old = self
            .monitors
            .write()
            .await
            .insert(call_id.to_string(), MonitorHandle { cancel, task });
        if let Some(old) = old {
            old.cancel.cancel();
        }
    }

    pub async fn is_running(&self, call_id: &str) -> bool {
        self.monitors.read().await.contains_key(call_id)
    }

    pub async fn active_count(&self) -> usize {
        self.monitors.read().await.len()
    }

    pub async fn cancel(&self, call_id: &str) -> bool {
        match self.monitors.read().await.get(call_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Take the task out of the registry and wait for it to finish.
    pub async fn wait(&self, call_id: &str) {
        let handle = self.monitors.write().await.remove(call_id);
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }
    }

    /// Cancel everything and wait for the tasks to drain.
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.write().await;
            monitors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        let _ = futures::future::join_all(handles.into_iter().map(|h| h.task)).await;
    }
}

#[derive(Clone)]
pub struct CallMonitor {
    calls: Arc<dyn CallRepository>,
    active_calls: Arc<ActiveCallStore>,
    provider: Arc<dyn VoiceProvider>,
    reconciler: Arc<WebhookReconciler>,
    writeback: Arc<CrmWriteback>,
    registry: MonitorRegistry,
    config: MonitorConfig,
}

impl CallMonitor {
    pub fn new(
        calls: Arc<dyn CallRepository>,
        active_calls: Arc<ActiveCallStore>,
        provider: Arc<dyn VoiceProvider>,
        reconciler: Arc<WebhookReconciler>,
        writeback: Arc<CrmWriteback>,
        registry: MonitorRegistry,
        config: MonitorConfig,
    ) -> Self {
        Self {
            calls,
            active_calls,
            provider,
            reconciler,
            writeback,
            registry,
            config,
        }
    }

    /// Start watching a freshly created call. Infallible by design: a call
    /// that exists but is unwatched still ends correctly through webhooks
    /// plus the slot TTL, so scheduling must never fail call creation.
    pub async fn spawn(&self, record: &CallRecord) {
        let monitor = self.clone();
        let call_id = record.call_id.clone();
        let user_id = record.user_id;
        self.registry
            .spawn(&record.call_id, async move {
                monitor.watch(call_id, user_id).await;
            })
            .await;
    }

    async fn watch(self, call_id: String, user_id: i64) {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut last_provider_poll = tokio::time::Instant::now();

        loop {
            ticker.tick().await;

            let record = match self.calls.get_by_call_id(&call_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::warn!("monitored call {} vanished from the store", call_id);
                    return;
                }
                Err(e) => {
                    tracing::error!("monitor for {} failed to read record: {}", call_id, e);
                    return;
                }
            };

            if record.status.is_terminal() {
                self.finalize(&record, user_id).await;
                return;
            }

            // Keep the visible slot tracking the record.
            self.active_calls
                .update_status(user_id, &call_id, record.status)
                .await;

            if started.elapsed() >= self.config.max_duration {
                self.give_up(&call_id, user_id).await;
                return;
            }

            if last_provider_poll.elapsed() >= self.config.provider_poll_interval {
                last_provider_poll = tokio::time::Instant::now();
                self.poll_provider(&call_id).await;
            }
        }
    }

    /// Ask the provider for its view of the call and reconcile it. Covers
    /// webhook deliveries that never arrived.
    async fn poll_provider(&self, call_id: &str) {
        match self.provider.get_call_status(call_id).await {
            Ok(update) => {
                if let Err(e) = self.reconciler.apply(&update).await {
                    tracing::warn!("monitor reconcile for {} failed: {}", call_id, e);
                }
            }
            Err(ProviderError::NotFound(_)) => {
                // The provider no longer knows the call; without this the
                // record would stay active until the watch limit.
                tracing::warn!("provider lost call {}, marking failed", call_id);
                let update = CallUpdate::status(call_id, CallStatus::Failed);
                if let Err(e) = self.reconciler.apply(&update).await {
                    tracing::warn!("monitor reconcile for {} failed: {}", call_id, e);
                }
            }
            Err(e) => {
                tracing::warn!("provider poll for {} failed: {}", call_id, e);
            }
        }
    }

    async fn finalize(&self, record: &CallRecord, user_id: i64) {
        // Only clear the slot if it still belongs to this call; the user
        // may have started another call that superseded it.
        let cleared = self.active_calls.remove_if(user_id, &record.call_id).await;
        if !cleared {
            tracing::debug!(
                "slot for user {} no longer references call {}",
                user_id,
                record.call_id
            );
        }
        self.writeback.record_call(record).await;
        tracing::info!(
            "call {} finished: {}",
            record.call_id,
            record.status.display_name()
        );
    }

    /// Watch limit reached. One last provider poll, then free the user's
    /// slot but leave the record active for any late webhook; the CRM gets
    /// nothing, since the call never reached a terminal status.
    async fn give_up(&self, call_id: &str, user_id: i64) {
        match self.provider.get_call_status(call_id).await {
            Ok(update) => {
                if let Ok(Some(record)) = self.reconciler.apply(&update).await {
                    if record.status.is_terminal() {
                        self.finalize(&record, user_id).await;
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!("final provider poll for {} failed: {}", call_id, e),
        }

        let cleared = self.active_calls.remove_if(user_id, call_id).await;
        tracing::warn!(
            "gave up watching call {} after {:?}, still not terminal (slot cleared: {})",
            call_id,
            self.config.max_duration,
            cleared
        );
    }
}

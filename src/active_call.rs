//! In-memory active-call slots
//!
//! Fast answer to "does this user have a call right now". One slot per user;
//! writing a new slot supersedes the old one without provider-side cleanup.
//! Slots carry a TTL so a crashed monitor can never wedge a user: expired
//! slots are dropped lazily on read and by a periodic sweeper.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::models::{ActiveCallSlot, CallRecord, CallStatus};

pub struct ActiveCallStore {
    slots: RwLock<HashMap<i64, ActiveCallSlot>>,
    ttl: Duration,
}

impl ActiveCallStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    /// Write the user's slot from a call record, superseding any previous
    /// call. Last writer wins.
    pub async fn set_from_record(&self, record: &CallRecord) {
        let slot = ActiveCallSlot {
            user_id: record.user_id,
            call_id: record.call_id.clone(),
            project_id: record.project_id.clone(),
            provider: record.provider,
            status: record.status,
            phone_number: record.phone_number.clone(),
            listen_url: record.listen_url.clone(),
            started_at: record.started_at,
            provider_data: record.provider_data.clone(),
            expires_at: Utc::now() + self.ttl,
        };
        self.slots.write().await.insert(record.user_id, slot);
    }

    pub async fn get(&self, user_id: i64) -> Option<ActiveCallSlot> {
        let expired = {
            let slots = self.slots.read().await;
            match slots.get(&user_id) {
                Some(slot) if slot.expires_at > Utc::now() => return Some(slot.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut slots = self.slots.write().await;
            if let Some(slot) = slots.get(&user_id) {
                if slot.expires_at <= Utc::now() {
                    slots.remove(&user_id);
                }
            }
        }
        None
    }

    /// Unconditionally clear the user's slot.
    #[allow(dead_code)]
    pub async fn remove(&self, user_id: i64) -> Option<ActiveCallSlot> {
        self.slots.write().await.remove(&user_id)
    }

    /// Remove the slot only if it still refers to `call_id`. A monitor
    /// finishing an old call must not clear the slot of a call that
    /// superseded it.
    pub async fn remove_if(&self, user_id: i64, call_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(&user_id) {
            Some(slot) if slot.call_id == call_id => {
                slots.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Refresh the slot's status so the active-call endpoint tracks the
    /// record. Ignored when the slot belongs to a different call.
    pub async fn update_status(&self, user_id: i64, call_id: &str, status: CallStatus) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(&user_id) {
            Some(slot) if slot.call_id == call_id => {
                slot.status = status;
                true
            }
            _ => false,
        }
    }

    /// Drop every expired slot, returning how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        let now = Utc::now();
        slots.retain(|_, slot| slot.expires_at > now);
        before - slots.len()
    }

    pub async fn active_count(&self) -> usize {
        let now = Utc::now();
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    /// Periodic cleanup loop, spawned once at startup.
    pub async fn run_sweeper(self: Arc<Self>, every: std::time::Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = self.sweep().await;
            if removed > 0 {
                tracing::debug!("expired {} stale active-call slot(s)", removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallProvider;
    use serde_json::json;

    fn record(user_id: i64, call_id: &str) -> CallRecord {
        CallRecord {
            id: 1,
            user_id,
            project_id: None,
            call_id: call_id.to_string(),
            provider: CallProvider::Vapi,
            status: CallStatus::Queued,
            phone_number: "+15550001111".to_string(),
            is_active: true,
            listen_url: None,
            recording_url: None,
            started_at: Utc::now(),
            ended_at: None,
            provider_data: json!({}),
            analysis_data: None,
            transcript: None,
        }
    }

    #[tokio::test]
    async fn test_second_call_supersedes_first_slot() {
        let store = ActiveCallStore::new(300);
        store.set_from_record(&record(1, "call-a")).await;
        store.set_from_record(&record(1, "call-b")).await;

        let slot = store.get(1).await.unwrap();
        assert_eq!(slot.call_id, "call-b");
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_if_only_clears_matching_call() {
        let store = ActiveCallStore::new(300);
        store.set_from_record(&record(1, "call-b")).await;

        assert!(!store.remove_if(1, "call-a").await);
        assert!(store.get(1).await.is_some());

        assert!(store.remove_if(1, "call-b").await);
        assert!(store.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_update_status_checks_call_id() {
        let store = ActiveCallStore::new(300);
        store.set_from_record(&record(1, "call-b")).await;

        assert!(!store.update_status(1, "call-a", CallStatus::InProgress).await);
        assert!(store.update_status(1, "call-b", CallStatus::InProgress).await);
        assert_eq!(store.get(1).await.unwrap().status, CallStatus::InProgress);
    }

    #[tokio::test]
    async fn test_expired_slots_are_invisible_and_swept() {
        let store = ActiveCallStore::new(0);
        store.set_from_record(&record(1, "call-a")).await;
        store.set_from_record(&record(2, "call-b")).await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(store.get(1).await.is_none());
        assert_eq!(store.active_count().await, 0);
        assert_eq!(store.sweep().await, 1);
    }
}

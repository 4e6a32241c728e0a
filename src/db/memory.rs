//! In-memory repository implementations for tests. Mirror the SQL semantics
//! of the Postgres repositories, including the terminal-status guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::db::{CallRepository, UserRepository};
use crate::models::{CallRecord, CallStatus, NewCallRecord, User};

#[derive(Default)]
pub struct MemoryCallRepository {
    rows: RwLock<HashMap<String, CallRecord>>,
    next_id: AtomicI64,
}

#[async_trait::async_trait]
impl CallRepository for MemoryCallRepository {
    async fn insert(&self, new: NewCallRecord) -> Result<CallRecord, sqlx::Error> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&new.call_id) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate call_id {}",
                new.call_id
            )));
        }
        let record = CallRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            user_id: new.user_id,
            project_id: new.project_id,
            call_id: new.call_id.clone(),
            provider: new.provider,
            status: new.status,
            phone_number: new.phone_number,
            is_active: new.status.is_active(),
            listen_url: new.listen_url,
            recording_url: None,
            started_at: Utc::now(),
            ended_at: None,
            provider_data: new.provider_data,
            analysis_data: None,
            transcript: None,
        };
        rows.insert(new.call_id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(call_id) else {
            return Ok(None);
        };
        let next_active = status.is_active();
        if !row.is_active && next_active {
            // Same rejection the SQL WHERE clause performs.
            return Ok(None);
        }
        row.status = status;
        row.is_active = next_active;
        if !next_active && row.ended_at.is_none() {
            row.ended_at = Some(Utc::now());
        }
        Ok(Some(row.clone()))
    }

    async fn update_recording(
        &self,
        call_id: &str,
        recording_url: &str,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        let mut rows = self.rows.write().await;
        Ok(rows.get_mut(call_id).map(|row| {
            row.recording_url = Some(recording_url.to_string());
            row.clone()
        }))
    }

    async fn update_transcript(
        &self,
        call_id: &str,
        transcript: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        let mut rows = self.rows.write().await;
        Ok(rows.get_mut(call_id).map(|row| {
            row.transcript = Some(transcript.clone());
            row.clone()
        }))
    }

    async fn update_analysis(
        &self,
        call_id: &str,
        analysis: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        let mut rows = self.rows.write().await;
        Ok(rows.get_mut(call_id).map(|row| {
            row.analysis_data = Some(analysis.clone());
            row.clone()
        }))
    }

    async fn get_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, sqlx::Error> {
        Ok(self.rows.read().await.get(call_id).cloned())
    }

    async fn get_active_call(&self, user_id: i64) -> Result<Option<CallRecord>, sqlx::Error> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id && r.is_active)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_recent(&self, user_id: i64, limit: i64) -> Result<Vec<CallRecord>, sqlx::Error> {
        let mut calls: Vec<CallRecord> = self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        calls.truncate(limit as usize);
        Ok(calls)
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<i64, User>>,
}

impl MemoryUserRepository {
    pub async fn insert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait::async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallProvider;
    use serde_json::json;

    fn new_call(user_id: i64, call_id: &str) -> NewCallRecord {
        NewCallRecord {
            user_id,
            project_id: Some("job-77".to_string()),
            call_id: call_id.to_string(),
            provider: CallProvider::Vapi,
            status: CallStatus::Queued,
            phone_number: "+15550001111".to_string(),
            listen_url: None,
            provider_data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_terminal_status_sets_ended_at_once() {
        let repo = MemoryCallRepository::default();
        repo.insert(new_call(1, "call-a")).await.unwrap();

        let first = repo
            .update_status("call-a", CallStatus::Ended)
            .await
            .unwrap()
            .unwrap();
        let first_ended = first.ended_at.unwrap();
        assert!(!first.is_active);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Replaying the terminal status must not move ended_at.
        let second = repo
            .update_status("call-a", CallStatus::Ended)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.ended_at, Some(first_ended));
    }

    #[tokio::test]
    async fn test_terminal_status_never_regresses_to_active() {
        let repo = MemoryCallRepository::default();
        repo.insert(new_call(1, "call-a")).await.unwrap();
        repo.update_status("call-a", CallStatus::Ended)
            .await
            .unwrap();

        let rejected = repo
            .update_status("call-a", CallStatus::InProgress)
            .await
            .unwrap();
        assert!(rejected.is_none());

        let row = repo.get_by_call_id("call-a").await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ended);
        assert!(!row.is_active);
        assert!(row.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_active_call_lookup_skips_ended_rows() {
        let repo = MemoryCallRepository::default();
        repo.insert(new_call(1, "call-a")).await.unwrap();
        repo.update_status("call-a", CallStatus::Ended)
            .await
            .unwrap();
        repo.insert(new_call(1, "call-b")).await.unwrap();

        let active = repo.get_active_call(1).await.unwrap().unwrap();
        assert_eq!(active.call_id, "call-b");

        assert!(repo.get_active_call(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let repo = MemoryCallRepository::default();
        repo.insert(new_call(1, "call-a")).await.unwrap();
        assert!(repo.insert(new_call(2, "call-a")).await.is_err());
    }
}

//! Call record database operations

use sqlx::PgPool;

use crate::db::CallRepository;
use crate::models::{CallRecord, CallStatus, NewCallRecord};

#[derive(Clone)]
pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CallRepository for PgCallRepository {
    async fn insert(&self, new: NewCallRecord) -> Result<CallRecord, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            INSERT INTO calls (user_id, project_id, call_id, provider, status,
                               phone_number, is_active, listen_url, provider_data, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            RETURNING id, user_id, project_id, call_id, provider, status, phone_number,
                      is_active, listen_url, recording_url, started_at, ended_at,
                      provider_data, analysis_data, transcript
            "#,
        )
        .bind(new.user_id)
        .bind(new.project_id)
        .bind(new.call_id)
        .bind(new.provider)
        .bind(new.status)
        .bind(new.phone_number)
        .bind(new.status.is_active())
        .bind(new.listen_url)
        .bind(new.provider_data)
        .fetch_one(&self.pool)
        .await
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        // The WHERE clause drops the write when it would take a terminal row
        // back to active; ended_at is stamped once, on first terminal status.
        sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE calls
            SET status = $2,
                is_active = $3,
                ended_at = CASE WHEN $3 = true THEN ended_at
                                ELSE COALESCE(ended_at, NOW()) END
            WHERE call_id = $1 AND NOT (is_active = false AND $3 = true)
            RETURNING id, user_id, project_id, call_id, provider, status, phone_number,
                      is_active, listen_url, recording_url, started_at, ended_at,
                      provider_data, analysis_data, transcript
            "#,
        )
        .bind(call_id)
        .bind(status)
        .bind(status.is_active())
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_recording(
        &self,
        call_id: &str,
        recording_url: &str,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE calls
            SET recording_url = $2
            WHERE call_id = $1
            RETURNING id, user_id, project_id, call_id, provider, status, phone_number,
                      is_active, listen_url, recording_url, started_at, ended_at,
                      provider_data, analysis_data, transcript
            "#,
        )
        .bind(call_id)
        .bind(recording_url)
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_transcript(
        &self,
        call_id: &str,
        transcript: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE calls
            SET transcript = $2
            WHERE call_id = $1
            RETURNING id, user_id, project_id, call_id, provider, status, phone_number,
                      is_active, listen_url, recording_url, started_at, ended_at,
                      provider_data, analysis_data, transcript
            "#,
        )
        .bind(call_id)
        .bind(transcript)
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_analysis(
        &self,
        call_id: &str,
        analysis: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE calls
            SET analysis_data = $2
            WHERE call_id = $1
            RETURNING id, user_id, project_id, call_id, provider, status, phone_number,
                      is_active, listen_url, recording_url, started_at, ended_at,
                      provider_data, analysis_data, transcript
            "#,
        )
        .bind(call_id)
        .bind(analysis)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT id, user_id, project_id, call_id, provider, status, phone_number,
                   is_active, listen_url, recording_url, started_at, ended_at,
                   provider_data, analysis_data, transcript
            FROM calls
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_active_call(&self, user_id: i64) -> Result<Option<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT id, user_id, project_id, call_id, provider, status, phone_number,
                   is_active, listen_url, recording_url, started_at, ended_at,
                   provider_data, analysis_data, transcript
            FROM calls
            WHERE user_id = $1 AND is_active = true
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_recent(&self, user_id: i64, limit: i64) -> Result<Vec<CallRecord>, sqlx::Error> {
        sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT id, user_id, project_id, call_id, provider, status, phone_number,
                   is_active, listen_url, recording_url, started_at, ended_at,
                   provider_data, analysis_data, transcript
            FROM calls
            WHERE user_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

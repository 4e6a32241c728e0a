//! Database access layer using sqlx with PostgreSQL

pub mod calls;
#[cfg(test)]
pub mod memory;
pub mod users;

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::models::{CallRecord, CallStatus, NewCallRecord, User};

pub use calls::PgCallRepository;
pub use users::PgUserRepository;

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Durable call-record store. Updates are keyed by the provider-assigned
/// call id and are field-level so out-of-order webhook deliveries converge.
///
/// Status updates enforce two invariants at the storage boundary:
/// a terminal status is never overwritten by a non-terminal one, and
/// `ended_at` is set exactly once, on the first terminal transition.
#[async_trait::async_trait]
pub trait CallRepository: Send + Sync {
    async fn insert(&self, new: NewCallRecord) -> Result<CallRecord, sqlx::Error>;

    /// Apply a status change. Returns the updated row, or `None` when the
    /// call id is unknown or the change was rejected as a terminal
    /// regression.
    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
    ) -> Result<Option<CallRecord>, sqlx::Error>;

    async fn update_recording(
        &self,
        call_id: &str,
        recording_url: &str,
    ) -> Result<Option<CallRecord>, sqlx::Error>;

    async fn update_transcript(
        &self,
        call_id: &str,
        transcript: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error>;

    async fn update_analysis(
        &self,
        call_id: &str,
        analysis: &serde_json::Value,
    ) -> Result<Option<CallRecord>, sqlx::Error>;

    async fn get_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, sqlx::Error>;

    /// Most recent still-active call for a user, if any.
    async fn get_active_call(&self, user_id: i64) -> Result<Option<CallRecord>, sqlx::Error>;

    async fn list_recent(&self, user_id: i64, limit: i64) -> Result<Vec<CallRecord>, sqlx::Error>;
}

#[async_trait::async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error>;
}

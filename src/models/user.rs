use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimal user row. Identity and account management live upstream; this
/// table exists so calls can be attributed and the outbound caller id check
/// can run before any provider traffic.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "outboundNumber")]
    pub outbound_number: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

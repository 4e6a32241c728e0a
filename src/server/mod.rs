//! HTTP backend for fieldcall
//!
//! This module contains the service surface:
//! - Call routes (place, inspect, end) behind JWT auth
//! - Provider webhook intake (signature-verified)
//! - Health and stats endpoints

pub mod auth;
pub mod webhooks;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::active_call::ActiveCallStore;
use crate::call_manager::{CallError, CallManager};
use crate::config::Settings;
use crate::crm::{build_crm_provider, CrmWriteback};
use crate::db::{self, CallRepository, UserRepository};
use crate::models::{
    ActiveCallSlot, CallRecord, CreateCallRequest, CreateCallResponse, EndCallResponse,
};
use crate::monitor::{CallMonitor, MonitorRegistry};
use crate::providers::{build_voice_provider, VoiceProvider};
use crate::reconcile::WebhookReconciler;

/// Application state shared across all routes. Holds trait objects rather
/// than a pool so the router can be exercised without a database.
pub struct AppState {
    pub manager: CallManager,
    pub monitors: MonitorRegistry,
    pub active_calls: Arc<ActiveCallStore>,
    pub provider: Arc<dyn VoiceProvider>,
    pub reconciler: Arc<WebhookReconciler>,
    pub jwt_secret: String,
    /// Externally visible base URL, no trailing slash. Webhook signature
    /// checks need the URL the provider actually posted to.
    pub public_url: String,
}

/// Create the Axum router with all API routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health and stats
        .route("/api/health", get(health_check))
        .route("/api/stats", get(get_stats))
        // Call routes
        .route("/api/calls", post(create_call))
        .route("/api/calls/active", get(get_active_call))
        .route("/api/calls/recent", get(get_recent_calls))
        .route("/api/calls/{call_id}", get(get_call))
        .route("/api/calls/{call_id}/end", post(end_call))
        // Provider webhooks; recording callbacks get their own path so the
        // provider can be pointed at either
        .route("/api/webhooks/voice", post(webhooks::handle_voice_webhook))
        .route(
            "/api/webhooks/voice/recording",
            post(webhooks::handle_voice_webhook),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// User-visible failure: machine-readable code plus a human message. What
/// went wrong internally stays in the logs.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        let (status, code) = match &err {
            CallError::Configuration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "configuration"),
            CallError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider"),
            CallError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            CallError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        let message = match &err {
            CallError::Database(e) => {
                tracing::error!("database error: {}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status,
            body: ErrorBody { code, message },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// Health check
async fn health_check() -> &'static str {
    "OK"
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "activeSlots": state.active_calls.active_count().await,
        "runningMonitors": state.monitors.active_count().await,
        "provider": state.provider.kind().display_name(),
    }))
}

async fn create_call(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
    Json(req): Json<CreateCallRequest>,
) -> Result<Json<CreateCallResponse>, ApiError> {
    let resp = state.manager.create_call(claims.sub, req).await?;
    Ok(Json(resp))
}

/// The caller's current call, or an explicit null.
async fn get_active_call(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
) -> Json<Option<ActiveCallSlot>> {
    Json(state.manager.active_call(claims.sub).await)
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
}

async fn get_recent_calls(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
    axum::extract::Query(query): axum::extract::Query<RecentQuery>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let calls = state
        .manager
        .list_recent_calls(claims.sub, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(calls))
}

async fn get_call(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
    axum::extract::Path(call_id): axum::extract::Path<String>,
) -> Result<Json<CallRecord>, ApiError> {
    let record = state.manager.get_call(claims.sub, &call_id).await?;
    Ok(Json(record))
}

async fn end_call(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
    axum::extract::Path(call_id): axum::extract::Path<String>,
) -> Result<Json<EndCallResponse>, ApiError> {
    let resp = state.manager.end_call(claims.sub, &call_id).await?;
    Ok(Json(resp))
}

/// Initialize and start the server
pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let pool = db::init_pool(&settings.database_url).await?;

    if let Err(e) = db::run_migrations(&pool).await {
        tracing::warn!("Migration warning (may be already applied): {}", e);
    }

    let users: Arc<dyn UserRepository> = Arc::new(db::users::PgUserRepository::new(pool.clone()));
    let calls: Arc<dyn CallRepository> = Arc::new(db::calls::PgCallRepository::new(pool));

    let active_calls = Arc::new(ActiveCallStore::new(settings.active_call_ttl_seconds));
    let provider = build_voice_provider(&settings);
    let reconciler = Arc::new(WebhookReconciler::new(calls.clone()));
    let writeback = Arc::new(CrmWriteback::new(build_crm_provider(&settings)));
    if writeback.enabled() {
        tracing::info!("CRM writeback enabled");
    } else {
        tracing::info!("CRM writeback not configured, call summaries stay local");
    }

    let monitors = MonitorRegistry::new();
    let monitor = CallMonitor::new(
        calls.clone(),
        active_calls.clone(),
        provider.clone(),
        reconciler.clone(),
        writeback,
        monitors.clone(),
        settings.monitor.clone(),
    );
    let manager = CallManager::new(
        users,
        calls,
        active_calls.clone(),
        provider.clone(),
        monitor,
    );

    // Expired slots also vanish lazily on read; the sweeper bounds map
    // growth for users who never come back.
    tokio::spawn(
        active_calls
            .clone()
            .run_sweeper(std::time::Duration::from_secs(60)),
    );

    let state = AppState {
        manager,
        monitors: monitors.clone(),
        active_calls,
        provider,
        reconciler,
        jwt_secret: settings.jwt_secret.clone(),
        public_url: settings.public_url.trim_end_matches('/').to_string(),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", settings.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(monitors))
        .await?;

    Ok(())
}

async fn shutdown_signal(monitors: MonitorRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    let running = monitors.active_count().await;
    tracing::info!("shutting down, draining {} call monitors", running);
    monitors.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryCallRepository, MemoryUserRepository};
    use crate::models::{CallProvider, CallStatus, NewCallRecord, User};
    use crate::monitor::MonitorConfig;
    use crate::providers::mock::MockVoiceProvider;
    use crate::providers::CallUpdate;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestBackend {
        app: Router,
        repo: Arc<MemoryCallRepository>,
        provider: Arc<MockVoiceProvider>,
    }

    const TEST_SECRET: &str = "router-test-secret";

    async fn backend() -> TestBackend {
        let users = Arc::new(MemoryUserRepository::default());
        users
            .insert(User {
                id: 7,
                email: "tech@example.com".to_string(),
                display_name: "Tech".to_string(),
                outbound_number: Some("+15550007777".to_string()),
                created_at: Utc::now(),
            })
            .await;

        let repo = Arc::new(MemoryCallRepository::default());
        let store = Arc::new(ActiveCallStore::new(300));
        let provider = Arc::new(MockVoiceProvider::new());
        let reconciler = Arc::new(WebhookReconciler::new(repo.clone()));
        let monitors = MonitorRegistry::new();
        let monitor = CallMonitor::new(
            repo.clone(),
            store.clone(),
            provider.clone(),
            reconciler.clone(),
            Arc::new(CrmWriteback::new(None)),
            monitors.clone(),
            MonitorConfig {
                poll_interval: Duration::from_millis(10),
                provider_poll_interval: Duration::from_secs(10),
                max_duration: Duration::from_secs(10),
            },
        );
        let manager = CallManager::new(
            users,
            repo.clone(),
            store.clone(),
            provider.clone(),
            monitor,
        );

        let app = create_router(AppState {
            manager,
            monitors,
            active_calls: store,
            provider: provider.clone(),
            reconciler,
            jwt_secret: TEST_SECRET.to_string(),
            public_url: "https://calls.example.com".to_string(),
        });

        TestBackend {
            app,
            repo,
            provider,
        }
    }

    fn bearer(user_id: i64) -> String {
        let exp = (Utc::now().timestamp() + 3600) as usize;
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &auth::Claims { sub: user_id, exp },
            &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {}", token)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn seed_call(user_id: i64, call_id: &str) -> NewCallRecord {
        NewCallRecord {
            user_id,
            project_id: None,
            call_id: call_id.to_string(),
            provider: CallProvider::Vapi,
            status: CallStatus::Queued,
            phone_number: "+15551234567".to_string(),
            listen_url: None,
            provider_data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let b = backend().await;
        let response = b
            .app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_call_routes_require_bearer_token() {
        let b = backend().await;
        let response = b
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/calls")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"phoneNumber":"+15551234567"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(b.provider.created_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_call_and_read_active_slot() {
        let b = backend().await;
        let response = b
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/calls")
                    .header("authorization", bearer(7))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "phoneNumber": "+15551234567", "projectId": "job-9" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        assert_eq!(created["status"], "QUEUED");
        let call_id = created["callId"].as_str().unwrap().to_string();

        let response = b
            .app
            .oneshot(
                Request::builder()
                    .uri("/api/calls/active")
                    .header("authorization", bearer(7))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let slot = body_json(response).await;
        assert_eq!(slot["callId"], call_id.as_str());
        assert_eq!(slot["projectId"], "job-9");
    }

    #[tokio::test]
    async fn test_unknown_user_cannot_create_calls() {
        let b = backend().await;
        let response = b
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/calls")
                    .header("authorization", bearer(8))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"phoneNumber":"+15551234567"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_unverified_webhook_acknowledged_without_mutation() {
        let b = backend().await;
        b.repo.insert(seed_call(7, "call-1")).await.unwrap();
        b.provider.set_verify(false);
        b.provider
            .push_webhook(CallUpdate::status("call-1", CallStatus::Ended))
            .await;

        let response = b
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/voice")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"anything":"at all"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        // Indistinguishable from success on the wire, dropped internally.
        assert_eq!(response.status(), StatusCode::OK);
        let record = b.repo.get_by_call_id("call-1").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Queued);
    }

    #[tokio::test]
    async fn test_verified_webhook_updates_record() {
        let b = backend().await;
        b.repo.insert(seed_call(7, "call-1")).await.unwrap();
        b.provider
            .push_webhook(CallUpdate::status("call-1", CallStatus::Ended))
            .await;

        let response = b
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/voice")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":{"type":"status-update"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let record = b.repo.get_by_call_id("call-1").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_end_call_route_checks_ownership() {
        let b = backend().await;
        b.repo.insert(seed_call(7, "call-1")).await.unwrap();

        let response = b
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/calls/call-1/end")
                    .header("authorization", bearer(99))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(b.provider.ended_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_active_call_returns_explicit_null() {
        let b = backend().await;
        let response = b
            .app
            .oneshot(
                Request::builder()
                    .uri("/api/calls/active")
                    .header("authorization", bearer(7))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, Value::Null);
    }
}

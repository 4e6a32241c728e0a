//! Provider webhook intake
//!
//! Providers retry on non-2xx and cannot tell a rejection from an outage,
//! so every outcome here is a 200: verified deliveries go through the
//! reconciler, unverified or unparseable ones are logged and dropped. The
//! externally visible URL is rebuilt from configuration because Twilio
//! signs over the exact URL it posted to.

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use std::sync::Arc;

use crate::server::AppState;

pub async fn handle_voice_webhook(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let request_url = format!("{}{}", state.public_url, uri);

    if !state.provider.verify_webhook(&request_url, &headers, &body) {
        // Dropped without detail: the response must not reveal whether
        // verification exists, let alone why it failed.
        tracing::warn!("dropping unverified webhook delivery ({} bytes)", body.len());
        return StatusCode::OK;
    }

    let update = match state.provider.parse_webhook(&headers, &body).await {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!("unparseable webhook delivery: {}", e);
            return StatusCode::OK;
        }
    };

    // Deliveries that carry nothing to write (agent-leg callbacks,
    // conference bookkeeping) stop here.
    if update.call_id.is_empty() || update.is_empty() {
        return StatusCode::OK;
    }

    if let Err(e) = state.reconciler.apply(&update).await {
        tracing::error!("webhook reconcile for {} failed: {}", update.call_id, e);
    }

    StatusCode::OK
}

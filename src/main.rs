//! fieldcall - CRM-connected outbound calling backend
//!
//! Places outbound calls through a configurable voice provider (Vapi or
//! Twilio), follows each call to a terminal status via webhooks and a
//! per-call monitor task, and writes a summary back into the CRM job.

mod active_call;
mod call_manager;
mod config;
mod crm;
mod db;
mod models;
mod monitor;
mod providers;
mod reconcile;
mod server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldcall=info".parse().unwrap()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = config::Settings::from_env()?;
    tracing::info!("Starting fieldcall server on port {}", settings.port);

    server::run_server(settings).await
}

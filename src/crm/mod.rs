//! CRM integrations
//!
//! Thin write-only adapters: after a call finishes, a plain-text summary is
//! attached to the CRM project the call was about. Nothing here models CRM
//! data; the project id is an opaque string owned by the CRM.

pub mod jobnimbus;
pub mod servicetitan;
pub mod writeback;

use std::sync::Arc;

use thiserror::Error;

use crate::config::{CrmSettings, Settings};

pub use jobnimbus::JobNimbusClient;
pub use servicetitan::ServiceTitanClient;
pub use writeback::CrmWriteback;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmKind {
    ServiceTitan,
    JobNimbus,
}

impl CrmKind {
    pub fn display_name(&self) -> &str {
        match self {
            CrmKind::ServiceTitan => "ServiceTitan",
            CrmKind::JobNimbus => "JobNimbus",
        }
    }
}

impl std::str::FromStr for CrmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "servicetitan" => Ok(CrmKind::ServiceTitan),
            "jobnimbus" => Ok(CrmKind::JobNimbus),
            other => Err(format!("unknown crm provider '{}'", other)),
        }
    }
}

#[async_trait::async_trait]
pub trait CrmProvider: Send + Sync {
    fn kind(&self) -> CrmKind;

    /// Attach a call summary note to the CRM project.
    async fn update_project(&self, project_id: &str, summary: &str) -> Result<(), CrmError>;
}

/// CRM is optional: without configuration every writeback becomes a logged
/// no-op instead of an error.
pub fn build_crm_provider(settings: &Settings) -> Option<Arc<dyn CrmProvider>> {
    settings.crm.as_ref().map(|crm| match crm {
        CrmSettings::ServiceTitan(cfg) => Arc::new(ServiceTitanClient::new(
            cfg.app_key.clone(),
            cfg.tenant_id.clone(),
            cfg.api_token.clone(),
        )) as Arc<dyn CrmProvider>,
        CrmSettings::JobNimbus(cfg) => {
            Arc::new(JobNimbusClient::new(cfg.api_key.clone())) as Arc<dyn CrmProvider>
        }
    })
}

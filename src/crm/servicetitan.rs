//! ServiceTitan API client

use reqwest::Client;
use serde::Serialize;

use crate::crm::{CrmError, CrmKind, CrmProvider};

#[derive(Clone)]
pub struct ServiceTitanClient {
    client: Client,
    app_key: String,
    tenant_id: String,
    api_token: String,
    base_url: String,
}

impl ServiceTitanClient {
    pub fn new(app_key: String, tenant_id: String, api_token: String) -> Self {
        Self {
            client: Client::new(),
            app_key,
            tenant_id,
            api_token,
            base_url: "https://api.servicetitan.io".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl CrmProvider for ServiceTitanClient {
    fn kind(&self) -> CrmKind {
        CrmKind::ServiceTitan
    }

    async fn update_project(&self, project_id: &str, summary: &str) -> Result<(), CrmError> {
        let body = JobNoteRequest {
            text: summary,
            pin_to_top: false,
        };

        let response = self
            .client
            .post(format!(
                "{}/jpm/v2/tenant/{}/jobs/{}/notes",
                self.base_url, self.tenant_id, project_id
            ))
            .header("Authorization", &self.api_token)
            .header("ST-App-Key", &self.app_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(CrmError::Api { status, message });
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JobNoteRequest<'a> {
    text: &'a str,
    #[serde(rename = "pinToTop")]
    pin_to_top: bool,
}

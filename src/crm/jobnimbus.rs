//! JobNimbus API client

use reqwest::Client;
use serde::Serialize;

use crate::crm::{CrmError, CrmKind, CrmProvider};

#[derive(Clone)]
pub struct JobNimbusClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl JobNimbusClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://app.jobnimbus.com/api1".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl CrmProvider for JobNimbusClient {
    fn kind(&self) -> CrmKind {
        CrmKind::JobNimbus
    }

    async fn update_project(&self, project_id: &str, summary: &str) -> Result<(), CrmError> {
        let body = ActivityRequest {
            note: summary,
            record_type_name: "Note",
            primary: RelatedRecord { id: project_id },
        };

        let response = self
            .client
            .post(format!("{}/activities", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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
struct ActivityRequest<'a> {
    note: &'a str,
    record_type_name: &'a str,
    primary: RelatedRecord<'a>,
}

#[derive(Serialize)]
struct RelatedRecord<'a> {
    id: &'a str,
}

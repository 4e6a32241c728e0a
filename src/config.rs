//! Environment-driven runtime configuration. Read once at startup; nothing
//! re-reads the environment afterwards.

use std::time::Duration;

use crate::models::CallProvider;
use crate::monitor::MonitorConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub port: u16,
    /// Externally reachable base URL, used to build the webhook callback
    /// URLs handed to providers. No trailing slash needed.
    pub public_url: String,
    pub jwt_secret: String,
    pub voice_provider: VoiceProviderSettings,
    pub crm: Option<CrmSettings>,
    pub active_call_ttl_seconds: u64,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone)]
pub enum VoiceProviderSettings {
    Vapi(VapiSettings),
    Twilio(TwilioSettings),
}

#[derive(Debug, Clone)]
pub struct VapiSettings {
    pub api_key: String,
    pub assistant_id: String,
    pub phone_number_id: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub enum CrmSettings {
    ServiceTitan(ServiceTitanSettings),
    JobNimbus(JobNimbusSettings),
}

#[derive(Debug, Clone)]
pub struct ServiceTitanSettings {
    pub app_key: String,
    pub tenant_id: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct JobNimbusSettings {
    pub api_key: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = require("DATABASE_URL")?;
        let public_url = require("PUBLIC_URL")?;
        let jwt_secret = require("JWT_SECRET")?;
        let port = number("PORT", 8080) as u16;

        let kind: CallProvider = std::env::var("VOICE_PROVIDER")
            .unwrap_or_else(|_| "vapi".to_string())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let voice_provider = match kind {
            CallProvider::Vapi => VoiceProviderSettings::Vapi(VapiSettings {
                api_key: require("VAPI_API_KEY")?,
                assistant_id: require("VAPI_ASSISTANT_ID")?,
                phone_number_id: require("VAPI_PHONE_NUMBER_ID")?,
                webhook_secret: require("VAPI_WEBHOOK_SECRET")?,
            }),
            CallProvider::Twilio => VoiceProviderSettings::Twilio(TwilioSettings {
                account_sid: require("TWILIO_ACCOUNT_SID")?,
                auth_token: require("TWILIO_AUTH_TOKEN")?,
            }),
        };

        // CRM writeback only runs when a provider is configured.
        let crm = match std::env::var("CRM_PROVIDER") {
            Ok(name) => {
                let kind: crate::crm::CrmKind =
                    name.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                Some(match kind {
                    crate::crm::CrmKind::ServiceTitan => {
                        CrmSettings::ServiceTitan(ServiceTitanSettings {
                            app_key: require("SERVICETITAN_APP_KEY")?,
                            tenant_id: require("SERVICETITAN_TENANT_ID")?,
                            api_token: require("SERVICETITAN_API_TOKEN")?,
                        })
                    }
                    crate::crm::CrmKind::JobNimbus => CrmSettings::JobNimbus(JobNimbusSettings {
                        api_key: require("JOBNIMBUS_API_KEY")?,
                    }),
                })
            }
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            port,
            public_url,
            jwt_secret,
            voice_provider,
            crm,
            active_call_ttl_seconds: number("ACTIVE_CALL_TTL_SECONDS", 4 * 3600),
            monitor: MonitorConfig {
                poll_interval: Duration::from_secs(number("MONITOR_POLL_SECONDS", 2)),
                provider_poll_interval: Duration::from_secs(number(
                    "MONITOR_PROVIDER_POLL_SECONDS",
                    30,
                )),
                max_duration: Duration::from_secs(number("CALL_MAX_DURATION_SECONDS", 4 * 3600)),
            },
        })
    }

    pub fn voice_webhook_url(&self) -> String {
        format!("{}/api/webhooks/voice", self.public_url.trim_end_matches('/'))
    }
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{} must be set", name))
}

fn number(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_url_normalizes_trailing_slash() {
        let settings = Settings {
            database_url: "postgres://localhost/fieldcall".to_string(),
            port: 8080,
            public_url: "https://calls.example.com/".to_string(),
            jwt_secret: "secret".to_string(),
            voice_provider: VoiceProviderSettings::Vapi(VapiSettings {
                api_key: "key".to_string(),
                assistant_id: "asst".to_string(),
                phone_number_id: "pn".to_string(),
                webhook_secret: "shh".to_string(),
            }),
            crm: None,
            active_call_ttl_seconds: 300,
            monitor: MonitorConfig::default(),
        };
        assert_eq!(
            settings.voice_webhook_url(),
            "https://calls.example.com/api/webhooks/voice"
        );
    }

    #[test]
    fn test_provider_names_parse_case_insensitively() {
        assert_eq!("Twilio".parse::<CallProvider>(), Ok(CallProvider::Twilio));
        assert_eq!("VAPI".parse::<CallProvider>(), Ok(CallProvider::Vapi));
        assert!("skype".parse::<CallProvider>().is_err());
    }
}

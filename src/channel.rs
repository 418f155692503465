use crate::phone::PhoneKey;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Acknowledgement body for the Twilio webhook; replies go out through the
/// Messages API instead of TwiML.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

const TWILIO_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel rejected message (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("channel transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, to: &PhoneKey, body: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl TwilioConfig {
    pub fn from_env() -> Option<Self> {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            account_sid: non_empty("TWILIO_ACCOUNT_SID")?,
            auth_token: non_empty("TWILIO_AUTH_TOKEN")?,
            from_number: non_empty("TWILIO_PHONE_NUMBER")?,
        })
    }
}

/// Sends WhatsApp replies through the Twilio Messages API. Without
/// credentials every message is only logged.
pub struct TwilioMessenger {
    config: Option<TwilioConfig>,
    api_base: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    message: Option<String>,
}

impl TwilioMessenger {
    pub fn new(config: Option<TwilioConfig>, http: Client) -> Self {
        Self {
            config,
            api_base: TWILIO_API_BASE.to_string(),
            http,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn is_live(&self) -> bool {
        self.config.is_some()
    }
}

#[async_trait]
impl Messenger for TwilioMessenger {
    async fn send_text(&self, to: &PhoneKey, body: &str) -> Result<(), ChannelError> {
        let Some(config) = &self.config else {
            info!(target = "konnect.channel", to = %to.masked(), body, "mock_whatsapp_send");
            return Ok(());
        };

        let from = format!("whatsapp:{}", config.from_number);
        let to_address = format!("whatsapp:{}", to.as_str());
        let response = self
            .http
            .post(format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                self.api_base, config.account_sid
            ))
            .basic_auth(&config.account_sid, Some(&config.auth_token))
            .form(&[
                ("From", from.as_str()),
                ("To", to_address.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<TwilioError>()
                .await
                .ok()
                .and_then(|err| err.message)
                .unwrap_or_else(|| "Failed to send message".to_string());
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        debug!(target = "konnect.channel", to = %to.masked(), "whatsapp_sent");
        Ok(())
    }
}

/// Buffers replies so a synchronous transport can return them in its
/// response body.
#[derive(Clone, Default)]
pub struct ReplyCollector {
    replies: Arc<Mutex<Vec<String>>>,
}

impl ReplyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replies(&self) -> Vec<String> {
        self.replies.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.replies.lock().await)
    }
}

#[async_trait]
impl Messenger for ReplyCollector {
    async fn send_text(&self, _to: &PhoneKey, body: &str) -> Result<(), ChannelError> {
        self.replies.lock().await.push(body.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpTimeouts, build_client};
    use crate::phone::normalize;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn live(server: &MockServer) -> TwilioMessenger {
        TwilioMessenger::new(
            Some(TwilioConfig {
                account_sid: "AC1".into(),
                auth_token: "tok".into(),
                from_number: "+14155238886".into(),
            }),
            build_client(HttpTimeouts::default()),
        )
        .with_api_base(server.uri())
    }

    #[tokio::test]
    async fn posts_form_with_whatsapp_addresses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC1/Messages.json"))
            .and(header("authorization", "Basic QUMxOnRvaw=="))
            .and(body_string_contains("To=whatsapp%3A%2B14165550199"))
            .and(body_string_contains("From=whatsapp%3A%2B14155238886"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "SM1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        live(&server)
            .send_text(&normalize("whatsapp:+1 416 555 0199"), "hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn api_errors_carry_twilio_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number."
            })))
            .mount(&server)
            .await;

        let err = live(&server)
            .send_text(&normalize("+1"), "hello")
            .await
            .unwrap_err();
        assert!(
            matches!(err, ChannelError::Rejected { status: 400, ref message } if message.contains("not a valid"))
        );
    }

    #[tokio::test]
    async fn missing_credentials_only_log() {
        let messenger = TwilioMessenger::new(None, build_client(HttpTimeouts::default()));
        assert!(!messenger.is_live());
        messenger
            .send_text(&normalize("+14165550199"), "hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn collector_drains_in_order() {
        let collector = ReplyCollector::new();
        let to = normalize("+14165550199");
        collector.send_text(&to, "first").await.unwrap();
        collector.send_text(&to, "second").await.unwrap();
        assert_eq!(collector.take().await, ["first", "second"]);
        assert!(collector.replies().await.is_empty());
    }
}

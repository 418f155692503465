use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

impl HttpTimeouts {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request: secs_from_env("HTTP_TIMEOUT_SECS").unwrap_or(defaults.request),
            connect: secs_from_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(defaults.connect),
        }
    }
}

fn secs_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
}

/// Builds the one outbound client shared by the store, blob store, LLM and
/// Twilio adapters.
pub fn build_client(timeouts: HttpTimeouts) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}

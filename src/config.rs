use crate::channel::TwilioConfig;
use crate::http::HttpTimeouts;
use crate::llm::ChatConfig;
use crate::pipeline::PipelineSettings;
use crate::quota::DEFAULT_FREE_POST_LIMIT;
use crate::rate_limit::DEFAULT_DAILY_LIMIT;
use crate::store::SupabaseConfig;
use chrono::{FixedOffset, Offset, Utc};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_APP_URL: &str = "https://indiankonnect.com";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub app_url: String,
    pub daily_post_limit: u32,
    pub free_post_limit: u64,
    pub trigger_keywords: Vec<String>,
    pub rate_limit_offset: FixedOffset,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
    pub idempotency_ttl: Duration,
    pub redis_url: Option<String>,
    pub openapi_key: Option<String>,
    pub metrics_key: Option<String>,
    pub http: HttpTimeouts,
    pub supabase: Option<SupabaseConfig>,
    pub openai: Option<ChatConfig>,
    pub twilio: Option<TwilioConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.http = HttpTimeouts::from_env();
        config.supabase = SupabaseConfig::from_env();
        config.openai = ChatConfig::from_env();
        config.twilio = TwilioConfig::from_env();
        config
    }

    /// Reads the scalar settings through `lookup`; the external service
    /// blocks stay unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());

        let offset_minutes = get("RATE_LIMIT_UTC_OFFSET_MINUTES")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        let rate_limit_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(
                    target = "konnect.config",
                    offset_minutes, "RATE_LIMIT_UTC_OFFSET_MINUTES out of range; using UTC"
                );
                Utc.fix()
            });

        let trigger_keywords = get("TRIGGER_KEYWORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|keywords| !keywords.is_empty())
            .unwrap_or_else(|| vec!["post".to_string(), "konnect".to_string()]);

        Self {
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8000),
            app_url: get("APP_URL")
                .or_else(|| get("NEXT_PUBLIC_APP_URL"))
                .unwrap_or_else(|| DEFAULT_APP_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            daily_post_limit: parsed("DAILY_POST_LIMIT")
                .filter(|v| *v > 0)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(DEFAULT_DAILY_LIMIT),
            free_post_limit: parsed("FREE_POST_LIMIT").unwrap_or(DEFAULT_FREE_POST_LIMIT),
            trigger_keywords,
            rate_limit_offset,
            request_max_bytes: parsed("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(256 * 1024),
            queue_capacity: parsed("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(64),
            idempotency_ttl: Duration::from_secs(
                parsed("IDEMPOTENCY_TTL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(86_400),
            ),
            redis_url: get("REDIS_URL"),
            openapi_key: get("OPENAPI_KEY"),
            metrics_key: get("METRICS_KEY"),
            http: HttpTimeouts::default(),
            supabase: None,
            openai: None,
            twilio: None,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            app_url: self.app_url.clone(),
            daily_post_limit: self.daily_post_limit,
            free_post_limit: self.free_post_limit,
            trigger_keywords: self.trigger_keywords.clone(),
            rate_limit_offset: self.rate_limit_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.app_url, DEFAULT_APP_URL);
        assert_eq!(cfg.daily_post_limit, 5);
        assert_eq!(cfg.free_post_limit, 100);
        assert_eq!(cfg.trigger_keywords, ["post", "konnect"]);
        assert_eq!(cfg.rate_limit_offset.local_minus_utc(), 0);
        assert_eq!(cfg.request_max_bytes, 256 * 1024);
        assert_eq!(cfg.idempotency_ttl, Duration::from_secs(86_400));
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("PORT", "9090"),
            ("APP_URL", "https://staging.example.com/"),
            ("DAILY_POST_LIMIT", "3"),
            ("TRIGGER_KEYWORDS", " Sell , POST ,,"),
            ("RATE_LIMIT_UTC_OFFSET_MINUTES", "-300"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]);
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.app_url, "https://staging.example.com");
        assert_eq!(cfg.daily_post_limit, 3);
        assert_eq!(cfg.trigger_keywords, ["sell", "post"]);
        assert_eq!(cfg.rate_limit_offset.local_minus_utc(), -300 * 60);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("DAILY_POST_LIMIT", "0"),
            ("RATE_LIMIT_UTC_OFFSET_MINUTES", "100000"),
            ("QUEUE_CAPACITY", "lots"),
        ]);
        assert_eq!(cfg.daily_post_limit, 5);
        assert_eq!(cfg.rate_limit_offset.local_minus_utc(), 0);
        assert_eq!(cfg.queue_capacity, 64);
    }
}

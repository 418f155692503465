use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const BRIDGE_KEY_HEADER: &str = "X-Konnect-Key";

/// API keys accepted from chat bridge processes.
#[derive(Clone)]
pub struct BridgeAuth {
    keys: Arc<HashMap<String, BridgeIdentity>>,
}

/// Which bridge a request came from; inserted into request extensions.
#[derive(Clone, Debug)]
pub struct BridgeIdentity {
    pub name: String,
    pub key_id: String,
}

impl BridgeAuth {
    /// Reads `BRIDGE_API_KEYS` as `name:key,name:key`.
    pub fn from_env() -> Self {
        Self::from_spec(&env::var("BRIDGE_API_KEYS").unwrap_or_default())
    }

    pub fn from_spec(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.splitn(2, ':');
            let name = parts.next().map(str::trim).filter(|s| !s.is_empty());
            let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match (name, key) {
                (Some(name), Some(secret)) => {
                    keys.insert(
                        secret.to_string(),
                        BridgeIdentity {
                            name: name.to_string(),
                            key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "konnect.api",
                    entry = idx + 1,
                    "ignored malformed BRIDGE_API_KEYS entry"
                ),
            }
        }

        if keys.is_empty() {
            warn!(
                target = "konnect.api",
                "no bridge API keys configured; bridge routes will reject every request"
            );
        } else {
            info!(
                target = "konnect.api",
                key_count = keys.len(),
                "loaded bridge API keys"
            );
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<BridgeIdentity> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_bridge_auth(
    State(auth): State<BridgeAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Konnect-Key or Bearer token",
        ));
    };

    let Some(identity) = auth.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(BRIDGE_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Single-key gate for `/metrics` and `/openapi.json`; open when no key is
/// configured.
pub fn key_gate_allows(headers: &http::HeaderMap, header: &str, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|presented| {
            presented.len() == expected.len()
                && presented
                    .bytes()
                    .zip(expected.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        })
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ApiError::new(code, message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn keys_are_parsed_and_malformed_entries_skipped() {
        let auth = BridgeAuth::from_spec("wa-bridge:s3cret, broken ,:nokey,other:k2");
        assert_eq!(auth.authenticate("s3cret").unwrap().name, "wa-bridge");
        assert_eq!(auth.authenticate("k2").unwrap().key_id, "key-04");
        assert!(auth.authenticate("nokey").is_none());
    }

    #[test]
    fn empty_spec_accepts_nothing() {
        let auth = BridgeAuth::from_spec("");
        assert!(auth.authenticate("demo-key").is_none());
    }

    #[test]
    fn bearer_and_custom_header_are_accepted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc"));

        let mut headers = http::HeaderMap::new();
        headers.insert(BRIDGE_KEY_HEADER, HeaderValue::from_static(" xyz "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn single_key_gate_requires_exact_match() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Metrics-Key", HeaderValue::from_static("m-key"));
        assert!(key_gate_allows(&headers, "X-Metrics-Key", Some("m-key")));
        assert!(!key_gate_allows(&headers, "X-Metrics-Key", Some("m-kez")));
        assert!(!key_gate_allows(&http::HeaderMap::new(), "X-Metrics-Key", Some("m-key")));
        assert!(key_gate_allows(&http::HeaderMap::new(), "X-Metrics-Key", None));
    }
}

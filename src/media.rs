//! Inbound image handling: fetch or decode the attachment, enforce the size
//! cap, and persist it to blob storage.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{Rng, distr::Alphanumeric};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Download credentials are only ever sent to this domain and its subdomains.
const TWILIO_MEDIA_DOMAIN: &str = "twilio.com";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Image is too large. Maximum size is {}MB", MAX_IMAGE_BYTES / 1024 / 1024)]
    TooLarge { bytes: usize },
    #[error("Image could not be downloaded")]
    Download(String),
    #[error("Image data could not be decoded")]
    Decode,
    #[error("Failed to upload image. Please try again.")]
    Upload(String),
}

/// Attachment as delivered by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMedia {
    /// Bytes shipped inline, optionally as a `data:` URL.
    Inline {
        mime_type: String,
        data_base64: String,
    },
    /// A URL the transport hosts; Twilio media needs the account credentials.
    Remote {
        url: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns a public URL.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        mime_type: &str,
    ) -> Result<String, MediaError>;
}

/// Supabase Storage bucket with public read access.
pub struct SupabaseStorage {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

impl SupabaseStorage {
    pub fn new(config: &crate::store::SupabaseConfig, http: Client) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.storage_bucket.clone(),
            http,
        }
    }

    pub fn public_url(&self, object: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, object
        )
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        mime_type: &str,
    ) -> Result<String, MediaError> {
        ensure_within_cap(bytes.len())?;
        let object = unique_object_name(extension);
        let response = self
            .http
            .post(format!(
                "{}/storage/v1/object/{}/{}",
                self.base_url, self.bucket, object
            ))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Content-Type", mime_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| MediaError::Upload(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MediaError::Upload(format!("HTTP {status}: {body}")));
        }
        debug!(target = "konnect.media", object = %object, "image_uploaded");
        Ok(self.public_url(&object))
    }
}

/// Keeps uploads in memory; used when no storage bucket is configured.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_names(&self) -> Vec<String> {
        self.objects
            .lock()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        extension: &str,
        _mime_type: &str,
    ) -> Result<String, MediaError> {
        ensure_within_cap(bytes.len())?;
        let object = unique_object_name(extension);
        self.objects.lock().await.push((object.clone(), bytes));
        Ok(format!("memory://post-images/{object}"))
    }
}

fn ensure_within_cap(len: usize) -> Result<(), MediaError> {
    if len > MAX_IMAGE_BYTES {
        return Err(MediaError::TooLarge { bytes: len });
    }
    Ok(())
}

/// `<unix millis>-<11 random chars>.<ext>`
fn unique_object_name(extension: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(11)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!(
        "{}-{}.{}",
        chrono::Utc::now().timestamp_millis(),
        suffix,
        extension
    )
}

/// `image/jpeg; charset=...` → `jpeg`, falling back to `jpg`.
fn extension_for(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .and_then(|essence| essence.split('/').nth(1))
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .unwrap_or("jpg")
        .to_string()
}

fn is_image(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

#[derive(Debug)]
pub enum MediaOutcome {
    /// Not an image; ignored without telling the sender.
    Skipped,
    Stored(String),
    Failed(MediaError),
}

pub struct MediaProcessor {
    blobs: Arc<dyn BlobStore>,
    http: Client,
    download_auth: Option<(String, String)>,
    auth_domain: String,
}

impl MediaProcessor {
    pub fn new(blobs: Arc<dyn BlobStore>, http: Client) -> Self {
        Self {
            blobs,
            http,
            download_auth: None,
            auth_domain: TWILIO_MEDIA_DOMAIN.to_string(),
        }
    }

    /// Basic-auth credentials sent when downloading media hosted by Twilio.
    /// Other hosts are fetched anonymously.
    pub fn with_download_auth(mut self, user: String, password: String) -> Self {
        self.download_auth = Some((user, password));
        self
    }

    #[cfg(test)]
    fn with_auth_domain(mut self, domain: &str) -> Self {
        self.auth_domain = domain.to_string();
        self
    }

    pub async fn process(&self, media: &InboundMedia) -> MediaOutcome {
        let loaded = match media {
            InboundMedia::Inline {
                mime_type,
                data_base64,
            } => {
                if !is_image(mime_type) {
                    return MediaOutcome::Skipped;
                }
                decode_inline(data_base64).map(|bytes| (bytes, mime_type.clone()))
            }
            InboundMedia::Remote { url, mime_type } => {
                if let Some(declared) = mime_type
                    && !is_image(declared)
                {
                    return MediaOutcome::Skipped;
                }
                match self.download(url).await {
                    Ok((bytes, served)) => {
                        let mime = mime_type.clone().or(served).unwrap_or_default();
                        if !is_image(&mime) {
                            return MediaOutcome::Skipped;
                        }
                        Ok((bytes, mime))
                    }
                    Err(err) => Err(err),
                }
            }
        };

        let result = match loaded {
            Ok((bytes, mime)) => {
                self.blobs
                    .upload(bytes, &extension_for(&mime), &mime)
                    .await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(url) => MediaOutcome::Stored(url),
            Err(err) => {
                warn!(target = "konnect.media", error = ?err, "image_dropped");
                MediaOutcome::Failed(err)
            }
        }
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>), MediaError> {
        let mut request = self.http.get(url);
        if let Some((user, password)) = &self.download_auth {
            if host_within(url, &self.auth_domain) {
                request = request.basic_auth(user, Some(password));
            } else {
                debug!(target = "konnect.media", "remote_media_fetched_without_credentials");
            }
        }
        let response = request
            .send()
            .await
            .map_err(|err| MediaError::Download(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MediaError::Download(format!("HTTP {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            ensure_within_cap(len as usize)?;
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| MediaError::Download(err.to_string()))?;
        ensure_within_cap(bytes.len())?;
        Ok((bytes.to_vec(), mime))
    }
}

/// `true` when `url`'s host is `domain` or one of its subdomains.
fn host_within(url: &str, domain: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            host == domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
}

fn decode_inline(data: &str) -> Result<Vec<u8>, MediaError> {
    let payload = data.split_once(',').map(|(_, rest)| rest).unwrap_or(data);
    // Reject oversized payloads before paying for the decode.
    ensure_within_cap(payload.len() / 4 * 3)?;
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|_| MediaError::Decode)?;
    ensure_within_cap(bytes.len())?;
    Ok(bytes)
}

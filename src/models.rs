use crate::media::InboundMedia;
use crate::pipeline::PipelineOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport-neutral inbound chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: String,
    pub body: String,
    pub is_forwarded: bool,
    pub media: Option<InboundMedia>,
    pub message_id: Option<String>,
}

/// Twilio WhatsApp webhook form. Only the fields the pipeline reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwilioWebhookForm {
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "Body", default)]
    pub body: Option<String>,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
    #[serde(rename = "MediaUrl0", default)]
    pub media_url0: Option<String>,
    #[serde(rename = "MediaContentType0", default)]
    pub media_content_type0: Option<String>,
    #[serde(rename = "Forwarded", default)]
    pub forwarded: Option<String>,
}

impl TwilioWebhookForm {
    /// `None` when `From` or `Body` is missing or blank.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let from = self.from.filter(|v| !v.trim().is_empty())?;
        let body = self.body.filter(|v| !v.trim().is_empty())?;
        let has_media = self
            .num_media
            .as_deref()
            .and_then(|n| n.trim().parse::<u32>().ok())
            .is_some_and(|n| n > 0);
        let media = match (has_media, self.media_url0) {
            (true, Some(url)) if !url.trim().is_empty() => Some(InboundMedia::Remote {
                url,
                mime_type: self.media_content_type0,
            }),
            _ => None,
        };
        Some(InboundMessage {
            from,
            body,
            is_forwarded: self
                .forwarded
                .as_deref()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            media,
            message_id: self.message_sid.filter(|v| !v.trim().is_empty()),
        })
    }
}

/// Body of `POST /messages` and `POST /jobs/messages`, sent by a chat
/// connection process.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeMessageRequest {
    pub from: String,
    pub body: String,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub media: Option<InboundMedia>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl From<BridgeMessageRequest> for InboundMessage {
    fn from(request: BridgeMessageRequest) -> Self {
        let media = request.media.or_else(|| {
            request
                .media_url
                .filter(|url| !url.trim().is_empty())
                .map(|url| InboundMedia::Remote {
                    url,
                    mime_type: None,
                })
        });
        Self {
            from: request.from,
            body: request.body,
            is_forwarded: request.is_forwarded,
            media,
            message_id: request.message_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeMessageResponse {
    #[serde(flatten)]
    pub outcome: PipelineOutcome,
    /// Texts the bridge must deliver to the sender, in order.
    pub replies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(error: &str, detail: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            detail: Some(detail.into()),
        }
    }
}

//! Free text → candidate listing.
//!
//! [`MessageParser`] asks the completion service first when one is
//! configured and falls back to the keyword rules in [`fallback`] on any
//! failure. Both paths produce the same loosely-typed [`CandidateListing`];
//! nothing here is trusted until it passes the validator.

pub mod fallback;

use crate::llm::{ChatClient, ChatMessage};
use crate::sanitize::strip_html;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::fmt;
use thiserror::Error;
use tracing::warn;

const SYSTEM_PROMPT: &str = r#"
You are a parser that extracts classified post information from WhatsApp messages for an
Indian community marketplace abroad. Extract these fields:
- category: one of room_rent, need_room, ride_share, deals, parcel, job, buy_sell, help
- title: short headline for the post
- description: the full post details
- price: number, only if a price is mentioned
- currency: ISO code such as INR, CAD, USD
- veg_only: true or false
- gender_filter: male, female or both
- city: city name, only if mentioned
Return a single JSON object only, no other text.
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    RoomRent,
    NeedRoom,
    RideShare,
    Deals,
    Parcel,
    Job,
    BuySell,
    Help,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::RoomRent,
        Category::NeedRoom,
        Category::RideShare,
        Category::Deals,
        Category::Parcel,
        Category::Job,
        Category::BuySell,
        Category::Help,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::RoomRent => "room_rent",
            Category::NeedRoom => "need_room",
            Category::RideShare => "ride_share",
            Category::Deals => "deals",
            Category::Parcel => "parcel",
            Category::Job => "job",
            Category::BuySell => "buy_sell",
            Category::Help => "help",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(input))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenderFilter {
    Male,
    Female,
    #[default]
    Both,
}

impl GenderFilter {
    pub const ALL: [GenderFilter; 3] = [GenderFilter::Male, GenderFilter::Female, GenderFilter::Both];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenderFilter::Male => "male",
            GenderFilter::Female => "female",
            GenderFilter::Both => "both",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL
            .into_iter()
            .find(|filter| filter.as_str().eq_ignore_ascii_case(input))
    }
}

/// Unvalidated parser output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateListing {
    pub category: String,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub veg_only: bool,
    pub gender_filter: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Llm,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedCandidate {
    pub candidate: CandidateListing,
    pub source: ParseSource,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message could not be parsed into a listing")]
pub struct ParseFailure;

pub struct MessageParser {
    llm: Option<ChatClient>,
}

impl MessageParser {
    pub fn new(llm: Option<ChatClient>) -> Self {
        Self { llm }
    }

    pub fn deterministic() -> Self {
        Self { llm: None }
    }

    pub fn uses_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn parse(&self, text: &str) -> Result<ParsedCandidate, ParseFailure> {
        if text.trim().is_empty() {
            return Err(ParseFailure);
        }

        if let Some(llm) = &self.llm {
            match parse_with_llm(llm, text).await {
                Ok(candidate) => {
                    return Ok(ParsedCandidate {
                        candidate,
                        source: ParseSource::Llm,
                    });
                }
                Err(reason) => {
                    warn!(target = "konnect.parser", reason = %reason, "llm_parse_fallback");
                }
            }
        }

        fallback::parse(text)
            .map(|candidate| ParsedCandidate {
                candidate,
                source: ParseSource::Fallback,
            })
            .ok_or(ParseFailure)
    }
}

async fn parse_with_llm(llm: &ChatClient, text: &str) -> Result<CandidateListing, String> {
    let messages = [
        ChatMessage::system(SYSTEM_PROMPT.trim()),
        ChatMessage::user(format!("Parse this WhatsApp message into a post:\n\n{text}")),
    ];
    let content = llm
        .complete_json(&messages)
        .await
        .map_err(|err| err.to_string())?;
    let cleaned = strip_markdown_fence(&content);
    let raw: RawParsedPost =
        serde_json::from_str(&cleaned).map_err(|err| format!("malformed completion: {err}"))?;
    Ok(raw.into_candidate(text))
}

/// Shape the completion service is asked for. Every field is optional and
/// loosely typed; `into_candidate` fills the same defaults the rest of the
/// pipeline expects.
#[serde_as]
#[derive(Debug, Deserialize)]
struct RawParsedPost {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    currency: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    veg_only: Option<bool>,
    #[serde(default)]
    gender_filter: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

impl RawParsedPost {
    fn into_candidate(self, original: &str) -> CandidateListing {
        let non_empty = |value: Option<String>| {
            value
                .map(|v| strip_html(v.trim()))
                .filter(|v| !v.is_empty())
        };
        CandidateListing {
            category: non_empty(self.category)
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|| "help".into()),
            title: non_empty(self.title).unwrap_or_else(|| "Untitled Post".into()),
            description: non_empty(self.description).unwrap_or_else(|| original.to_string()),
            price: self.price.as_ref().and_then(coerce_price),
            currency: Some(
                non_empty(self.currency)
                    .map(|c| c.to_uppercase())
                    .unwrap_or_else(|| "INR".into()),
            ),
            veg_only: self.veg_only.unwrap_or(false),
            gender_filter: Some(
                non_empty(self.gender_filter)
                    .map(|g| g.to_lowercase())
                    .unwrap_or_else(|| "both".into()),
            ),
            city: non_empty(self.city),
        }
    }
}

/// Accepts `650`, `"650"`, `"Rs.650"`, `"₹1,200/month"`; a range keeps its
/// lower bound. Zero and unparseable values count as no price.
fn coerce_price(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => fallback::first_price(s),
        _ => None,
    }?;
    (number != 0.0).then_some(number)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .skip(1)
        .take_while(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

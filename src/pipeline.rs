//! Message-to-post ingestion.
//!
//! [`Pipeline::handle`] walks one inbound message through rate limiting,
//! account resolution, quota, parsing, validation, city resolution and
//! persistence. Every message that carries a trigger keyword ends in exactly
//! one final reply; messages without one are ignored silently.

use crate::channel::Messenger;
use crate::city::CityMatcher;
use crate::media::{MediaOutcome, MediaProcessor};
use crate::models::{InboundMessage, StageReport};
use crate::parser::{CandidateListing, MessageParser, ParseSource};
use crate::phone::{PhoneKey, normalize};
use crate::quota::{PostQuota, QuotaDecision};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::replies;
use crate::sanitize::SanitizePolicy;
use crate::store::{NewPost, Post, Store, StoreError, StoreErrorKind, User};
use crate::validator::{self, MAX_PRICE, ValidatedListing, ValidationErrors};
use chrono::FixedOffset;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const IMAGE_MARKER: &str = "\n[Image attached]";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub app_url: String,
    pub daily_post_limit: u32,
    pub free_post_limit: u64,
    pub trigger_keywords: Vec<String>,
    pub rate_limit_offset: FixedOffset,
}

/// Whole-word, case-insensitive trigger detection plus leading-keyword
/// stripping.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    anywhere: Regex,
    leading: Regex,
}

impl TriggerMatcher {
    pub fn new(keywords: &[String]) -> Result<Self, regex::Error> {
        let alternation = keywords
            .iter()
            .map(|k| regex::escape(k.trim()))
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>()
            .join("|");
        Ok(Self {
            anywhere: Regex::new(&format!(r"(?i)\b(?:{alternation})\b"))?,
            leading: Regex::new(&format!(r"(?i)^\s*(?:{alternation})(?:\s+|$)"))?,
        })
    }

    pub fn matches(&self, body: &str) -> bool {
        self.anywhere.is_match(body)
    }

    pub fn strip_leading<'a>(&self, body: &'a str) -> &'a str {
        match self.leading.find(body) {
            Some(found) => &body[found.end()..],
            None => body,
        }
        .trim()
    }
}

/// Classified early exits. Each maps to one reply.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("daily post limit of {} reached", .0.limit)]
    RateLimited(RateDecision),
    #[error("posting not allowed: {0}")]
    QuotaDenied(String),
    #[error("account could not be created: {0}")]
    AccountCreation(StoreError),
    #[error("no listing text after the trigger keyword")]
    EmptyText,
    #[error("message could not be parsed into a listing")]
    ParseFailed,
    #[error("price {0} exceeds the storable maximum")]
    PriceOutOfRange(f64),
    #[error("listing failed validation: {0}")]
    Validation(ValidationErrors),
    #[error("listing could not be saved: {0}")]
    Persistence(StoreError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::RateLimited(_) => "rate_limited",
            IngestError::QuotaDenied(_) => "quota_denied",
            IngestError::AccountCreation(_) => "account_creation_failed",
            IngestError::EmptyText => "text_empty",
            IngestError::ParseFailed => "parse_failed",
            IngestError::PriceOutOfRange(_) => "price_out_of_range",
            IngestError::Validation(_) => "validation_failed",
            IngestError::Persistence(_) => "persistence_failed",
        }
    }

    fn reply(&self, app_url: &str) -> String {
        match self {
            IngestError::RateLimited(decision) => replies::rate_limited(decision),
            IngestError::QuotaDenied(reason) => replies::quota_denied(app_url, reason),
            IngestError::AccountCreation(_) => replies::account_error(),
            IngestError::EmptyText => replies::usage(),
            IngestError::ParseFailed => replies::parse_failed(),
            IngestError::PriceOutOfRange(price) => replies::price_too_large(*price),
            IngestError::Validation(errors) => replies::validation_failed(errors.errors()),
            IngestError::Persistence(err) => match err.kind() {
                StoreErrorKind::NumericOverflow => replies::persistence_price_overflow(),
                StoreErrorKind::PermissionDenied => replies::persistence_permission(),
                StoreErrorKind::Unavailable => replies::database_error(),
                StoreErrorKind::Rejected => replies::persistence_failed(err.detail()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// No trigger keyword; nothing was sent.
    Ignored,
    Posted { post_id: Uuid, post_url: String },
    Rejected { code: String, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    #[serde(flatten)]
    pub status: OutcomeStatus,
    /// Masked sender key.
    pub sender: String,
    pub stages: Vec<StageReport>,
}

impl PipelineOutcome {
    pub fn code(&self) -> &str {
        match &self.status {
            OutcomeStatus::Ignored => "ignored",
            OutcomeStatus::Posted { .. } => "posted",
            OutcomeStatus::Rejected { code, .. } => code,
        }
    }

    pub fn post_id(&self) -> Option<Uuid> {
        match &self.status {
            OutcomeStatus::Posted { post_id, .. } => Some(*post_id),
            _ => None,
        }
    }
}

struct PostedListing {
    post: Post,
    free_posts_remaining: Option<u64>,
    posts_remaining_today: Option<u32>,
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<PipelineSettings>,
    trigger: Arc<TriggerMatcher>,
    store: Arc<dyn Store>,
    rate_limiter: Arc<RateLimiter>,
    quota: Arc<PostQuota>,
    parser: Arc<MessageParser>,
    cities: Arc<CityMatcher>,
    media: Arc<MediaProcessor>,
    messenger: Arc<dyn Messenger>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        store: Arc<dyn Store>,
        parser: MessageParser,
        media: MediaProcessor,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self, regex::Error> {
        let trigger = TriggerMatcher::new(&settings.trigger_keywords)?;
        Ok(Self {
            rate_limiter: Arc::new(RateLimiter::new(
                store.clone(),
                settings.daily_post_limit,
                settings.rate_limit_offset,
            )),
            quota: Arc::new(PostQuota::new(store.clone(), settings.free_post_limit)),
            cities: Arc::new(CityMatcher::new(store.clone())),
            settings: Arc::new(settings),
            trigger: Arc::new(trigger),
            store,
            parser: Arc::new(parser),
            media: Arc::new(media),
            messenger,
        })
    }

    /// Replies through the pipeline's default messenger.
    pub async fn handle(&self, message: InboundMessage) -> PipelineOutcome {
        self.handle_with(message, self.messenger.clone()).await
    }

    pub async fn handle_with(
        &self,
        message: InboundMessage,
        messenger: Arc<dyn Messenger>,
    ) -> PipelineOutcome {
        let phone = normalize(&message.from);
        if !self.trigger.matches(&message.body) {
            debug!(target = "konnect.pipeline", phone = %phone.masked(), "message_ignored");
            crate::metrics::outcome("ignored");
            return PipelineOutcome {
                status: OutcomeStatus::Ignored,
                sender: phone.masked(),
                stages: Vec::new(),
            };
        }

        info!(target = "konnect.pipeline", phone = %phone.masked(), "processing_post_command");
        let task = {
            let pipeline = self.clone();
            let phone = phone.clone();
            let messenger = messenger.clone();
            tokio::spawn(async move { pipeline.run(message, phone, messenger).await })
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(
                    target = "konnect.pipeline",
                    phone = %phone.masked(),
                    error = %join_error,
                    "pipeline_task_failed"
                );
                deliver(messenger.as_ref(), &phone, &replies::unknown_error()).await;
                PipelineOutcome {
                    status: OutcomeStatus::Rejected {
                        code: "unknown".to_string(),
                        detail: join_error.to_string(),
                    },
                    sender: phone.masked(),
                    stages: Vec::new(),
                }
            }
        };
        crate::metrics::outcome(outcome.code());
        outcome
    }

    async fn run(
        &self,
        message: InboundMessage,
        phone: PhoneKey,
        messenger: Arc<dyn Messenger>,
    ) -> PipelineOutcome {
        let mut stages = Vec::new();
        let result = self
            .ingest(&message, &phone, messenger.as_ref(), &mut stages)
            .await;

        let (status, reply) = match result {
            Ok(posted) => {
                let post_url = replies::post_link(&self.settings.app_url, &posted.post.id.to_string());
                info!(
                    target = "konnect.pipeline",
                    phone = %phone.masked(),
                    post_id = %posted.post.id,
                    "post_created"
                );
                let reply = replies::post_created(
                    &self.settings.app_url,
                    &posted.post.id.to_string(),
                    posted.free_posts_remaining,
                    posted.posts_remaining_today,
                );
                (
                    OutcomeStatus::Posted {
                        post_id: posted.post.id,
                        post_url,
                    },
                    reply,
                )
            }
            Err(err) => {
                match &err {
                    IngestError::AccountCreation(_) | IngestError::Persistence(_) => warn!(
                        target = "konnect.pipeline",
                        phone = %phone.masked(),
                        code = err.code(),
                        error = %err,
                        "post_rejected"
                    ),
                    _ => info!(
                        target = "konnect.pipeline",
                        phone = %phone.masked(),
                        code = err.code(),
                        "post_rejected"
                    ),
                }
                let reply = err.reply(&self.settings.app_url);
                (
                    OutcomeStatus::Rejected {
                        code: err.code().to_string(),
                        detail: err.to_string(),
                    },
                    reply,
                )
            }
        };

        deliver(messenger.as_ref(), &phone, &reply).await;
        PipelineOutcome {
            status,
            sender: phone.masked(),
            stages,
        }
    }

    async fn ingest(
        &self,
        message: &InboundMessage,
        phone: &PhoneKey,
        messenger: &dyn Messenger,
        stages: &mut Vec<StageReport>,
    ) -> Result<PostedListing, IngestError> {
        let rate = self
            .capture_stage("rate_limit", stages, self.check_rate(phone))
            .await?;
        let user = self
            .capture_stage("resolve_user", stages, self.resolve_user(phone))
            .await?;
        let quota = self
            .capture_stage("post_quota", stages, self.check_quota(&user))
            .await?;
        let text = self
            .capture_stage("prepare_text", stages, self.prepare_text(message))
            .await?;
        let (text, images) = self
            .capture_stage(
                "media",
                stages,
                self.attach_media(message, phone, text, messenger),
            )
            .await?;
        let candidate = self
            .capture_stage("parse", stages, self.parse(&text))
            .await?;
        let listing = self
            .capture_stage("validate", stages, validate_listing(candidate))
            .await?;
        let city_id = self
            .capture_stage("resolve_city", stages, self.resolve_city(&user, &listing))
            .await?;
        let post = self
            .capture_stage(
                "persist",
                stages,
                self.persist(&user, listing, images, city_id),
            )
            .await?;

        Ok(PostedListing {
            post,
            free_posts_remaining: quota.free_posts_remaining.map(|n| n.saturating_sub(1)),
            posts_remaining_today: rate.remaining,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, IngestError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, IngestError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }

    async fn check_rate(&self, phone: &PhoneKey) -> Result<StageOutcome<RateDecision>, IngestError> {
        let decision = self.rate_limiter.check_and_increment(phone).await;
        if !decision.allowed {
            return Err(IngestError::RateLimited(decision));
        }
        let output = json!({
            "limit": decision.limit,
            "remaining": decision.remaining,
            "failed_open": decision.remaining.is_none(),
        });
        Ok(StageOutcome::new(decision, output))
    }

    async fn resolve_user(&self, phone: &PhoneKey) -> Result<StageOutcome<User>, IngestError> {
        match self.store.find_user_by_phone(phone).await {
            Ok(Some(user)) => {
                let output = json!({ "user_id": user.id, "created": false });
                return Ok(StageOutcome::new(user, output));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "konnect.pipeline",
                    phone = %phone.masked(),
                    error = %err,
                    "user_lookup_failed_creating"
                );
            }
        }
        let user = self
            .store
            .create_user(phone)
            .await
            .map_err(IngestError::AccountCreation)?;
        let output = json!({ "user_id": user.id, "created": true });
        Ok(StageOutcome::new(user, output))
    }

    async fn check_quota(&self, user: &User) -> Result<StageOutcome<QuotaDecision>, IngestError> {
        let decision = self.quota.can_post(user.id).await;
        if !decision.can_post {
            return Err(IngestError::QuotaDenied(
                decision
                    .reason
                    .unwrap_or_else(|| "Posting is not available right now.".to_string()),
            ));
        }
        let output = json!({
            "free_posts_remaining": decision.free_posts_remaining,
            "premium_path": decision.free_posts_remaining.is_none(),
        });
        Ok(StageOutcome::new(decision, output))
    }

    async fn prepare_text(&self, message: &InboundMessage) -> Result<StageOutcome<String>, IngestError> {
        let stripped = self.trigger.strip_leading(&message.body);
        let mut text = SanitizePolicy::Message.apply(stripped);
        if text.is_empty() {
            return Err(IngestError::EmptyText);
        }
        if message.is_forwarded {
            text = format!("Forwarded: {text}");
        }
        let output = json!({
            "chars": text.chars().count(),
            "forwarded": message.is_forwarded,
        });
        Ok(StageOutcome::new(text, output))
    }

    async fn attach_media(
        &self,
        message: &InboundMessage,
        phone: &PhoneKey,
        mut text: String,
        messenger: &dyn Messenger,
    ) -> Result<StageOutcome<(String, Vec<String>)>, IngestError> {
        let Some(media) = &message.media else {
            return Ok(StageOutcome::new((text, Vec::new()), json!({ "media": "none" })));
        };
        let (images, output) = match self.media.process(media).await {
            MediaOutcome::Stored(url) => {
                text.push_str(IMAGE_MARKER);
                let output = json!({ "media": "stored", "url": url });
                (vec![url], output)
            }
            MediaOutcome::Skipped => (Vec::new(), json!({ "media": "skipped" })),
            MediaOutcome::Failed(err) => {
                deliver(messenger, phone, &replies::image_dropped(&err.to_string())).await;
                (Vec::new(), json!({ "media": "dropped", "error": err.to_string() }))
            }
        };
        Ok(StageOutcome::new((text, images), output))
    }

    async fn parse(&self, text: &str) -> Result<StageOutcome<CandidateListing>, IngestError> {
        let parsed = self
            .parser
            .parse(text)
            .await
            .map_err(|_| IngestError::ParseFailed)?;
        let mut candidate = parsed.candidate;
        candidate.title = SanitizePolicy::Title.apply(&candidate.title);
        candidate.description = SanitizePolicy::Description.apply(&candidate.description);

        if let Some(price) = candidate.price {
            if price > MAX_PRICE {
                return Err(IngestError::PriceOutOfRange(price));
            }
            candidate.price = Some(((price * 100.0).round() / 100.0).min(MAX_PRICE));
        }

        let output = json!({
            "source": match parsed.source {
                ParseSource::Llm => "llm",
                ParseSource::Fallback => "fallback",
            },
            "category": candidate.category,
            "price": candidate.price,
            "city": candidate.city,
        });
        Ok(StageOutcome::new(candidate, output))
    }

    async fn resolve_city(
        &self,
        user: &User,
        listing: &ValidatedListing,
    ) -> Result<StageOutcome<Option<Uuid>>, IngestError> {
        if let Some(existing) = user.city_id {
            return Ok(StageOutcome::new(
                Some(existing),
                json!({ "city_id": existing, "source": "user" }),
            ));
        }
        let Some(name) = listing.city.as_deref() else {
            return Ok(StageOutcome::new(None, json!({ "city_id": null })));
        };
        let Some(city_id) = self.cities.match_city(name).await else {
            return Ok(StageOutcome::new(
                None,
                json!({ "city_id": null, "unresolved": name }),
            ));
        };
        if let Err(err) = self.store.assign_city_if_unset(user.id, city_id).await {
            warn!(
                target = "konnect.pipeline",
                user_id = %user.id,
                error = %err,
                "city_assignment_failed"
            );
        }
        Ok(StageOutcome::new(
            Some(city_id),
            json!({ "city_id": city_id, "source": "matched" }),
        ))
    }

    async fn persist(
        &self,
        user: &User,
        listing: ValidatedListing,
        images: Vec<String>,
        city_id: Option<Uuid>,
    ) -> Result<StageOutcome<Post>, IngestError> {
        let new_post = NewPost {
            user_id: user.id,
            category: listing.category,
            title: listing.title,
            description: listing.description,
            price: listing.price,
            currency: listing.currency,
            images,
            city_id,
            veg_only: listing.veg_only,
            gender_filter: listing.gender_filter,
            is_anonymous: false,
            is_premium: user.is_premium,
            is_verified_owner: user.is_verified,
            is_active: true,
        };
        let post = self
            .store
            .insert_post(&new_post)
            .await
            .map_err(IngestError::Persistence)?;
        let output = json!({ "post_id": post.id, "images": post.images.len() });
        Ok(StageOutcome::new(post, output))
    }
}

async fn validate_listing(
    candidate: CandidateListing,
) -> Result<StageOutcome<ValidatedListing>, IngestError> {
    let listing = validator::validate(&candidate).map_err(IngestError::Validation)?;
    let output = json!({
        "category": listing.category,
        "currency": listing.currency,
        "gender_filter": listing.gender_filter,
    });
    Ok(StageOutcome::new(listing, output))
}

async fn deliver(messenger: &dyn Messenger, phone: &PhoneKey, text: &str) {
    if let Err(err) = messenger.send_text(phone, text).await {
        warn!(
            target = "konnect.channel",
            phone = %phone.masked(),
            error = %err,
            "reply_send_failed"
        );
    }
}

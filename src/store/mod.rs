//! Relational store contract used by the ingestion pipeline.
//!
//! The pipeline only ever talks to [`Store`]; the process picks one
//! implementation at startup and shares it as `Arc<dyn Store>`.
//! [`SupabaseStore`] is the production path. [`MemoryStore`] keeps
//! everything in one process and is meant for local runs and tests.

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::{SupabaseConfig, SupabaseStore};

use crate::parser::{Category, GenderFilter};
use crate::phone::PhoneKey;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub phone: String,
    #[serde(default)]
    pub city_id: Option<Uuid>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub success_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct City {
    pub id: Uuid,
    pub name: String,
    pub country_code: String,
    #[serde(default)]
    pub flag_emoji: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Row written by the pipeline; the store assigns `id` and timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct NewPost {
    pub user_id: Uuid,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub currency: String,
    pub images: Vec<String>,
    pub city_id: Option<Uuid>,
    pub veg_only: bool,
    pub gender_filter: GenderFilter,
    pub is_anonymous: bool,
    pub is_premium: bool,
    pub is_verified_owner: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: Category,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub price: Option<f64>,
    pub currency: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub city_id: Option<Uuid>,
    pub veg_only: bool,
    pub gender_filter: GenderFilter,
    pub is_anonymous: bool,
    pub is_premium: bool,
    pub is_verified_owner: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of the atomic conditional increment on a daily bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketIncrement {
    /// The bucket was incremented; carries the new count.
    Counted(u32),
    /// The bucket was already at the limit and was left untouched.
    LimitReached(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NumericOverflow,
    PermissionDenied,
    Unavailable,
    Rejected,
}

#[derive(Debug, Clone, Error)]
#[error("store {kind:?}: {message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Rejected, message)
    }

    /// Classifies a Postgres/PostgREST error code.
    pub fn from_code(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code {
            Some("22003") => StoreErrorKind::NumericOverflow,
            Some("42501") => StoreErrorKind::PermissionDenied,
            _ if message.contains("numeric field overflow") => StoreErrorKind::NumericOverflow,
            _ => StoreErrorKind::Rejected,
        };
        Self { kind, message }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user_by_phone(&self, phone: &PhoneKey) -> Result<Option<User>, StoreError>;

    async fn create_user(&self, phone: &PhoneKey) -> Result<User, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Sets the user's city only when none is assigned yet.
    async fn assign_city_if_unset(&self, user_id: Uuid, city_id: Uuid) -> Result<(), StoreError>;

    async fn count_posts(&self) -> Result<u64, StoreError>;

    async fn insert_post(&self, post: &NewPost) -> Result<Post, StoreError>;

    /// Case-insensitive exact name match among active cities.
    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError>;

    /// Case-insensitive substring match among active cities.
    async fn search_cities(&self, fragment: &str, limit: usize) -> Result<Vec<City>, StoreError>;

    /// Atomically increments the `(phone, day)` bucket unless it already
    /// holds `limit` posts. Implementations must not split this into a
    /// separate read and write.
    async fn increment_daily_posts(
        &self,
        phone: &PhoneKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<BucketIncrement, StoreError>;
}

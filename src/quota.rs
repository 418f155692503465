use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_FREE_POST_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub can_post: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free slots left before this post, while the free tier is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_posts_remaining: Option<u64>,
}

impl QuotaDecision {
    fn denied(reason: &str) -> Self {
        Self {
            can_post: false,
            reason: Some(reason.to_string()),
            free_posts_remaining: None,
        }
    }
}

/// Global lifetime free tier, then premium-only posting.
///
/// The count is read and compared without reserving a slot, so two posts
/// racing at the boundary can both be admitted.
pub struct PostQuota {
    store: Arc<dyn Store>,
    free_limit: u64,
}

impl PostQuota {
    pub fn new(store: Arc<dyn Store>, free_limit: u64) -> Self {
        Self { store, free_limit }
    }

    pub async fn can_post(&self, user_id: Uuid) -> QuotaDecision {
        let total = match self.store.count_posts().await {
            Ok(total) => total,
            Err(err) => {
                warn!(target = "konnect.quota", error = %err, "post_count_failed");
                return QuotaDecision::denied("Database error");
            }
        };

        if total < self.free_limit {
            return QuotaDecision {
                can_post: true,
                reason: None,
                free_posts_remaining: Some(self.free_limit - total),
            };
        }

        match self.store.get_user(user_id).await {
            Ok(Some(user)) if user.is_premium => QuotaDecision {
                can_post: true,
                reason: None,
                free_posts_remaining: None,
            },
            Ok(Some(_)) => QuotaDecision::denied(
                "Free posts limit reached. Upgrade to Premium to continue posting.",
            ),
            Ok(None) => QuotaDecision::denied("User not found"),
            Err(err) => {
                warn!(target = "konnect.quota", %user_id, error = %err, "premium_lookup_failed");
                QuotaDecision::denied("Database error")
            }
        }
    }
}

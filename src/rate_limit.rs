use crate::phone::PhoneKey;
use crate::store::{BucketIncrement, Store};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DAILY_LIMIT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// `None` when the store could not be reached and the limiter failed open.
    pub remaining: Option<u32>,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    /// Rounded-up hours until the bucket resets, e.g. `"7 hours"`.
    pub fn retry_after_label(&self) -> String {
        let secs = self.retry_after.map(|d| d.as_secs()).unwrap_or(0);
        let hours = secs.div_ceil(3600).max(1);
        if hours == 1 {
            "1 hour".to_string()
        } else {
            format!("{hours} hours")
        }
    }
}

/// Per-sender daily post counter backed by the store's atomic increment.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    daily_limit: u32,
    offset: FixedOffset,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, daily_limit: u32, offset: FixedOffset) -> Self {
        Self {
            store,
            daily_limit: daily_limit.max(1),
            offset,
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub async fn check_and_increment(&self, phone: &PhoneKey) -> RateDecision {
        self.check_and_increment_at(phone, Utc::now()).await
    }

    pub async fn check_and_increment_at(&self, phone: &PhoneKey, now: DateTime<Utc>) -> RateDecision {
        let local = now.with_timezone(&self.offset);
        let day = local.date_naive();

        match self
            .store
            .increment_daily_posts(phone, day, self.daily_limit)
            .await
        {
            Ok(BucketIncrement::Counted(count)) => RateDecision {
                allowed: true,
                limit: self.daily_limit,
                remaining: Some(self.daily_limit.saturating_sub(count)),
                retry_after: None,
            },
            Ok(BucketIncrement::LimitReached(_)) => RateDecision {
                allowed: false,
                limit: self.daily_limit,
                remaining: Some(0),
                retry_after: Some(until_next_day(local, day)),
            },
            Err(err) => {
                warn!(
                    target = "konnect.rate_limit",
                    phone = %phone.masked(),
                    error = %err,
                    "rate_limit_store_unavailable_failing_open"
                );
                RateDecision {
                    allowed: true,
                    limit: self.daily_limit,
                    remaining: None,
                    retry_after: None,
                }
            }
        }
    }
}

fn until_next_day(local: DateTime<FixedOffset>, day: NaiveDate) -> Duration {
    let Some(midnight) = day
        .succ_opt()
        .and_then(|next| next.and_hms_opt(0, 0, 0))
    else {
        return Duration::from_secs(0);
    };
    (midnight - local.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::normalize;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn limiter(store: MemoryStore) -> RateLimiter {
        RateLimiter::new(
            Arc::new(store),
            DEFAULT_DAILY_LIMIT,
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    #[tokio::test]
    async fn remaining_counts_down_then_denies() {
        let limiter = limiter(MemoryStore::new());
        let phone = normalize("+14165550199");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 17, 0, 0).unwrap();

        for n in 1..=5u32 {
            let decision = limiter.check_and_increment_at(&phone, now).await;
            assert!(decision.allowed, "call {n} should be allowed");
            assert_eq!(decision.remaining, Some(5 - n));
        }

        let denied = limiter.check_and_increment_at(&phone, now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(7 * 3600)));
        assert_eq!(denied.retry_after_label(), "7 hours");
    }

    #[tokio::test]
    async fn denial_does_not_touch_bucket() {
        let store = MemoryStore::new();
        let limiter = limiter(store.clone());
        let phone = normalize("+14165550199");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        for _ in 0..7 {
            limiter.check_and_increment_at(&phone, now).await;
        }
        assert_eq!(store.bucket_count(&phone, now.date_naive()).await, 5);
    }

    #[tokio::test]
    async fn new_day_starts_a_fresh_bucket() {
        let limiter = limiter(MemoryStore::new());
        let phone = normalize("+14165550199");
        let day_one = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        for _ in 0..5 {
            limiter.check_and_increment_at(&phone, day_one).await;
        }
        assert!(!limiter.check_and_increment_at(&phone, day_one).await.allowed);

        let day_two = Utc.with_ymd_and_hms(2026, 3, 2, 0, 1, 0).unwrap();
        let decision = limiter.check_and_increment_at(&phone, day_two).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(4));
    }

    #[tokio::test]
    async fn senders_have_independent_buckets() {
        let limiter = limiter(MemoryStore::new());
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = normalize("+14165550100");
        let b = normalize("+14165550200");
        for _ in 0..5 {
            limiter.check_and_increment_at(&a, now).await;
        }
        assert!(limiter.check_and_increment_at(&b, now).await.allowed);
    }

    #[tokio::test]
    async fn concurrent_increments_never_exceed_limit() {
        let limiter = Arc::new(limiter(MemoryStore::new()));
        let phone = normalize("+14165550199");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                let phone = phone.clone();
                tokio::spawn(async move { limiter.check_and_increment_at(&phone, now).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let store = MemoryStore::new();
        store.fail_bucket_updates().await;
        let limiter = limiter(store);
        let decision = limiter
            .check_and_increment(&normalize("+14165550199"))
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, None);
    }

    #[tokio::test]
    async fn configured_offset_moves_the_day_boundary() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(
            Arc::new(store.clone()),
            5,
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
        );
        let phone = normalize("+919876543210");
        // 20:00 UTC on March 1st is already March 2nd in UTC+05:30.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();
        limiter.check_and_increment_at(&phone, now).await;
        let local_day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(store.bucket_count(&phone, local_day).await, 1);
    }
}

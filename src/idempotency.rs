use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

/// Drops webhook redeliveries by message id.
///
/// Uses `SET NX EX` in Redis when configured so every instance shares one
/// view; falls back to a process-local map when Redis is absent or failing.
#[derive(Clone)]
pub struct MessageDeduper {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl MessageDeduper {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn local(ttl: Duration) -> Self {
        Self::new(None, ttl)
    }

    /// `true` the first time `message_id` is seen within the TTL.
    pub async fn first_delivery(&self, message_id: &str) -> bool {
        let key = format!("konnect:msg:{message_id}");
        if let Some(client) = &self.redis {
            match redis_claim(client, &key, self.ttl).await {
                Ok(claimed) => return claimed,
                Err(err) => {
                    warn!(target = "konnect.idempotency", error = %err, "redis_claim_failed");
                }
            }
        }
        self.local_claim(key).await
    }

    /// Forgets a claim so a redelivery of `message_id` is processed again.
    pub async fn release(&self, message_id: &str) {
        let key = format!("konnect:msg:{message_id}");
        if let Some(client) = &self.redis
            && let Err(err) = redis_release(client, &key).await
        {
            warn!(target = "konnect.idempotency", error = %err, "redis_release_failed");
        }
        self.local.lock().await.remove(&key);
    }

    async fn local_claim(&self, key: String) -> bool {
        let now = Instant::now();
        let mut guard = self.local.lock().await;
        guard.retain(|_, expires| *expires > now);
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, now + self.ttl);
        true
    }
}

async fn redis_claim(
    client: &redis::Client,
    key: &str,
    ttl: Duration,
) -> Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let options = redis::SetOptions::default()
        .conditional_set(redis::ExistenceCheck::NX)
        .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1)));
    let reply: Option<String> = conn.set_options(key, 1, options).await?;
    Ok(reply.is_some())
}

async fn redis_release(client: &redis::Client, key: &str) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.del::<_, ()>(key).await
}

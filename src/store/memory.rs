use super::{BucketIncrement, City, NewPost, Post, Store, StoreError, StoreErrorKind, User};
use crate::phone::PhoneKey;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store for local runs and tests.
///
/// Every operation takes the same lock, which makes the bucket increment
/// atomic within one process. It gives no guarantees across instances, so a
/// multi-instance deployment must use [`super::SupabaseStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    posts: Vec<Post>,
    cities: Vec<City>,
    buckets: HashMap<(String, NaiveDate), u32>,
    fail_inserts: Option<StoreError>,
    fail_buckets: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cities(cities: Vec<City>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                cities,
                ..MemoryState::default()
            })),
        }
    }

    /// A small city table so a local run can exercise city resolution.
    pub fn with_default_cities() -> Self {
        let seed = [
            ("Toronto", "CA", "🇨🇦"),
            ("Brampton", "CA", "🇨🇦"),
            ("Mississauga", "CA", "🇨🇦"),
            ("Vancouver", "CA", "🇨🇦"),
            ("Montreal", "CA", "🇨🇦"),
            ("New York", "US", "🇺🇸"),
            ("San Francisco", "US", "🇺🇸"),
            ("London", "GB", "🇬🇧"),
        ];
        Self::with_cities(
            seed.iter()
                .map(|(name, code, flag)| City {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    country_code: code.to_string(),
                    flag_emoji: Some(flag.to_string()),
                    is_active: true,
                })
                .collect(),
        )
    }

    pub async fn posts(&self) -> Vec<Post> {
        self.state.lock().await.posts.clone()
    }

    pub async fn bucket_count(&self, phone: &PhoneKey, day: NaiveDate) -> u32 {
        self.state
            .lock()
            .await
            .buckets
            .get(&(phone.as_str().to_string(), day))
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_premium(&self, user_id: Uuid, premium: bool) {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.is_premium = premium;
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Makes every subsequent `insert_post` fail with the given error.
    pub async fn fail_post_inserts(&self, error: StoreError) {
        self.state.lock().await.fail_inserts = Some(error);
    }

    /// Makes every subsequent bucket increment fail as unreachable.
    pub async fn fail_bucket_updates(&self) {
        self.state.lock().await.fail_buckets = true;
    }

    /// Appends `count` placeholder listings owned by `user_id`.
    pub async fn seed_posts(&self, user_id: Uuid, count: usize) {
        let mut guard = self.state.lock().await;
        for idx in 0..count {
            let now = Utc::now();
            guard.posts.push(Post {
                id: Uuid::new_v4(),
                user_id,
                category: crate::parser::Category::Help,
                title: format!("Seeded listing {idx}"),
                description: "Seeded listing for quota accounting".to_string(),
                price: None,
                currency: "INR".to_string(),
                images: Vec::new(),
                city_id: None,
                veg_only: false,
                gender_filter: crate::parser::GenderFilter::Both,
                is_anonymous: false,
                is_premium: false,
                is_verified_owner: false,
                is_active: true,
                created_at: now,
                updated_at: now,
            });
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_phone(&self, phone: &PhoneKey) -> Result<Option<User>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .users
            .values()
            .find(|user| user.phone == phone.as_str())
            .cloned())
    }

    async fn create_user(&self, phone: &PhoneKey) -> Result<User, StoreError> {
        let mut guard = self.state.lock().await;
        if guard.users.values().any(|user| user.phone == phone.as_str()) {
            return Err(StoreError::rejected(format!(
                "duplicate key value violates unique constraint users_phone_key ({})",
                phone.masked()
            )));
        }
        let user = User {
            id: Uuid::new_v4(),
            phone: phone.as_str().to_string(),
            city_id: None,
            is_premium: false,
            is_verified: false,
            success_count: 0,
        };
        guard.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn assign_city_if_unset(&self, user_id: Uuid, city_id: Uuid) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        if let Some(user) = guard.users.get_mut(&user_id)
            && user.city_id.is_none()
        {
            user.city_id = Some(city_id);
        }
        Ok(())
    }

    async fn count_posts(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.posts.len() as u64)
    }

    async fn insert_post(&self, post: &NewPost) -> Result<Post, StoreError> {
        let mut guard = self.state.lock().await;
        if let Some(err) = guard.fail_inserts.clone() {
            return Err(err);
        }
        if let Some(price) = post.price
            && price.abs() >= 100_000_000.0
        {
            return Err(StoreError::new(
                StoreErrorKind::NumericOverflow,
                "numeric field overflow",
            ));
        }
        let now = Utc::now();
        let stored = Post {
            id: Uuid::new_v4(),
            user_id: post.user_id,
            category: post.category,
            title: post.title.clone(),
            description: post.description.clone(),
            price: post.price,
            currency: post.currency.clone(),
            images: post.images.clone(),
            city_id: post.city_id,
            veg_only: post.veg_only,
            gender_filter: post.gender_filter,
            is_anonymous: post.is_anonymous,
            is_premium: post.is_premium,
            is_verified_owner: post.is_verified_owner,
            is_active: post.is_active,
            created_at: now,
            updated_at: now,
        };
        guard.posts.push(stored.clone());
        Ok(stored)
    }

    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .cities
            .iter()
            .find(|city| city.is_active && city.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn search_cities(&self, fragment: &str, limit: usize) -> Result<Vec<City>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .cities
            .iter()
            .filter(|city| city.is_active && contains_ci(&city.name, fragment))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn increment_daily_posts(
        &self,
        phone: &PhoneKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<BucketIncrement, StoreError> {
        let mut guard = self.state.lock().await;
        if guard.fail_buckets {
            return Err(StoreError::unavailable("rate_limits table unreachable"));
        }
        let count = guard
            .buckets
            .entry((phone.as_str().to_string(), day))
            .or_insert(0);
        if *count >= limit {
            return Ok(BucketIncrement::LimitReached(*count));
        }
        *count += 1;
        Ok(BucketIncrement::Counted(*count))
    }
}

use super::{BucketIncrement, City, NewPost, Post, Store, StoreError, StoreErrorKind, User};
use crate::phone::PhoneKey;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

const USER_COLUMNS: &str = "id,phone,city_id,is_premium,is_verified,success_count";
const CITY_COLUMNS: &str = "id,name,country_code,flag_emoji,is_active";

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
    pub storage_bucket: String,
}

impl SupabaseConfig {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let storage_bucket =
            std::env::var("SUPABASE_STORAGE_BUCKET").unwrap_or_else(|_| "post-images".into());
        Some(Self {
            url: url.trim_end_matches('/').to_string(),
            service_key,
            storage_bucket,
        })
    }
}

/// PostgREST-backed store. The daily bucket increment goes through the
/// `increment_rate_limit` RPC (see `sql/increment_rate_limit.sql`), which is
/// a single conditional upsert.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RateLimitRow {
    allowed: bool,
    post_count: u32,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig, http: Client) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            http,
        }
    }

    fn rest(&self, method: Method, path_and_query: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, path_and_query))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::unavailable(err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<PostgrestError>(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|err| err.message.clone())
            .unwrap_or_else(|| format!("HTTP {status}"));
        let code = parsed.as_ref().and_then(|err| err.code.as_deref());
        if code.is_none() && matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(StoreError::new(StoreErrorKind::PermissionDenied, message));
        }
        if code.is_none() && status.is_server_error() {
            return Err(StoreError::unavailable(message));
        }
        Err(StoreError::from_code(code, message))
    }

    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, StoreError> {
        self.send(request)
            .await?
            .json::<Vec<T>>()
            .await
            .map_err(|err| StoreError::rejected(format!("invalid response: {err}")))
    }
}

/// Escapes LIKE metacharacters so user text only ever matches literally.
fn like_literal(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        match c {
            '\\' | '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            '*' => {}
            _ => out.push(c),
        }
    }
    out
}

fn total_from_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Store for SupabaseStore {
    async fn find_user_by_phone(&self, phone: &PhoneKey) -> Result<Option<User>, StoreError> {
        let query = format!(
            "users?phone=eq.{}&select={USER_COLUMNS}&limit=1",
            urlencoding::encode(phone.as_str())
        );
        let mut rows: Vec<User> = self.rows(self.rest(Method::GET, &query)).await?;
        Ok(rows.pop())
    }

    async fn create_user(&self, phone: &PhoneKey) -> Result<User, StoreError> {
        let request = self
            .rest(Method::POST, &format!("users?select={USER_COLUMNS}"))
            .header("Prefer", "return=representation")
            .json(&json!({
                "phone": phone.as_str(),
                "city_id": null,
                "is_premium": false,
                "is_verified": false,
            }));
        let mut rows: Vec<User> = self.rows(request).await?;
        rows.pop()
            .ok_or_else(|| StoreError::rejected("insert returned no user row"))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = format!("users?id=eq.{id}&select={USER_COLUMNS}&limit=1");
        let mut rows: Vec<User> = self.rows(self.rest(Method::GET, &query)).await?;
        Ok(rows.pop())
    }

    async fn assign_city_if_unset(&self, user_id: Uuid, city_id: Uuid) -> Result<(), StoreError> {
        let query = format!("users?id=eq.{user_id}&city_id=is.null");
        let request = self
            .rest(Method::PATCH, &query)
            .header("Prefer", "return=minimal")
            .json(&json!({ "city_id": city_id }));
        self.send(request).await?;
        Ok(())
    }

    async fn count_posts(&self) -> Result<u64, StoreError> {
        let request = self
            .rest(Method::HEAD, "posts?select=id")
            .header("Prefer", "count=exact");
        let response = self.send(request).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(total_from_content_range)
            .ok_or_else(|| StoreError::rejected("missing content-range count"))
    }

    async fn insert_post(&self, post: &NewPost) -> Result<Post, StoreError> {
        let request = self
            .rest(Method::POST, "posts?select=*")
            .header("Prefer", "return=representation")
            .json(post);
        let mut rows: Vec<Post> = self.rows(request).await?;
        rows.pop()
            .ok_or_else(|| StoreError::rejected("insert returned no post row"))
    }

    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError> {
        let query = format!(
            "cities?name=ilike.{}&is_active=eq.true&select={CITY_COLUMNS}&limit=1",
            urlencoding::encode(&like_literal(name))
        );
        let mut rows: Vec<City> = self.rows(self.rest(Method::GET, &query)).await?;
        Ok(rows.pop())
    }

    async fn search_cities(&self, fragment: &str, limit: usize) -> Result<Vec<City>, StoreError> {
        let pattern = format!("*{}*", like_literal(fragment));
        let query = format!(
            "cities?name=ilike.{}&is_active=eq.true&select={CITY_COLUMNS}&limit={limit}",
            urlencoding::encode(&pattern)
        );
        self.rows(self.rest(Method::GET, &query)).await
    }

    async fn increment_daily_posts(
        &self,
        phone: &PhoneKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<BucketIncrement, StoreError> {
        let request = self
            .rest(Method::POST, "rpc/increment_rate_limit")
            .json(&json!({
                "p_phone": phone.as_str(),
                "p_date": day.format("%Y-%m-%d").to_string(),
                "p_limit": limit,
            }));
        let mut rows: Vec<RateLimitRow> = self.rows(request).await?;
        let row = rows
            .pop()
            .ok_or_else(|| StoreError::rejected("increment_rate_limit returned no row"))?;
        Ok(if row.allowed {
            BucketIncrement::Counted(row.post_count)
        } else {
            BucketIncrement::LimitReached(row.post_count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpTimeouts, build_client};
    use crate::phone::normalize;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> SupabaseStore {
        let config = SupabaseConfig {
            url: server.uri(),
            service_key: "service-key".into(),
            storage_bucket: "post-images".into(),
        };
        SupabaseStore::new(&config, build_client(HttpTimeouts::default()))
    }

    #[test]
    fn like_literal_escapes_wildcards() {
        assert_eq!(like_literal("50%_off*"), "50\\%\\_off");
    }

    #[test]
    fn content_range_total() {
        assert_eq!(total_from_content_range("0-24/3573"), Some(3573));
        assert_eq!(total_from_content_range("*/0"), Some(0));
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[tokio::test]
    async fn count_posts_reads_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rest/v1/posts"))
            .and(header("Prefer", "count=exact"))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Range", "*/99"))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(store.count_posts().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn rate_limit_rpc_maps_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/increment_rate_limit"))
            .and(body_partial_json(serde_json::json!({
                "p_phone": "+14165550199",
                "p_date": "2026-03-01",
                "p_limit": 5,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "allowed": false, "post_count": 5 }])),
            )
            .mount(&server)
            .await;

        let store = store_for(&server);
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let outcome = store
            .increment_daily_posts(&normalize("+14165550199"), day, 5)
            .await
            .unwrap();
        assert_eq!(outcome, BucketIncrement::LimitReached(5));
    }

    #[tokio::test]
    async fn insert_post_classifies_numeric_overflow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/posts"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": "22003",
                "message": "numeric field overflow",
            })))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let post = NewPost {
            user_id: Uuid::new_v4(),
            category: crate::parser::Category::RoomRent,
            title: "Room".into(),
            description: "Room available downtown".into(),
            price: Some(1e12),
            currency: "INR".into(),
            images: vec![],
            city_id: None,
            veg_only: false,
            gender_filter: crate::parser::GenderFilter::Both,
            is_anonymous: false,
            is_premium: false,
            is_verified_owner: false,
            is_active: true,
        };
        let err = store.insert_post(&post).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NumericOverflow);
    }

    #[tokio::test]
    async fn find_user_uses_encoded_phone_filter() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .and(query_param("phone", "eq.+14165550199"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": id,
                "phone": "+14165550199",
                "city_id": null,
                "is_premium": true,
                "is_verified": false,
                "success_count": 3,
            }])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let user = store
            .find_user_by_phone(&normalize("+14165550199"))
            .await
            .unwrap()
            .expect("user row");
        assert_eq!(user.id, id);
        assert!(user.is_premium);
    }

    #[tokio::test]
    async fn forbidden_without_code_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(403).set_body_string("nope"))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store.get_user(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::PermissionDenied);
    }
}

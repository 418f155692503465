mod channel;
mod city;
mod config;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod media;
mod metrics;
mod models;
mod parser;
mod phone;
mod pipeline;
mod quota;
mod rate_limit;
mod replies;
mod sanitize;
mod security;
mod store;
mod validator;

use axum::{
    Json, Router,
    extract::{Extension, Form, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use channel::{EMPTY_TWIML, Messenger, ReplyCollector, TwilioMessenger};
use config::AppConfig;
use idempotency::MessageDeduper;
use jobs::JobQueue;
use media::{BlobStore, MediaProcessor, MemoryBlobStore, SupabaseStorage};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, BridgeMessageRequest, BridgeMessageResponse, TwilioWebhookForm};
use parser::MessageParser;
use pipeline::Pipeline;
use security::{BridgeAuth, BridgeIdentity, key_gate_allows, require_bridge_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, Store, SupabaseStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const OPENAPI_YAML: &str = include_str!("../docs/openapi.yaml");

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "konnect.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env();
    let http_client = http::build_client(config.http);

    let store: Arc<dyn Store> = match &config.supabase {
        Some(supabase) => Arc::new(SupabaseStore::new(supabase, http_client.clone())),
        None => {
            warn!(
                target = "konnect.api",
                "SUPABASE_URL not set; using the in-memory store (single instance only)"
            );
            Arc::new(MemoryStore::with_default_cities())
        }
    };
    let blobs: Arc<dyn BlobStore> = match &config.supabase {
        Some(supabase) => Arc::new(SupabaseStorage::new(supabase, http_client.clone())),
        None => Arc::new(MemoryBlobStore::new()),
    };
    let mut media = MediaProcessor::new(blobs, http_client.clone());
    if let Some(twilio) = &config.twilio {
        media = media.with_download_auth(twilio.account_sid.clone(), twilio.auth_token.clone());
    }
    let parser = MessageParser::new(
        config
            .openai
            .clone()
            .map(|openai| llm::ChatClient::new(openai, http_client.clone())),
    );
    if !parser.uses_llm() {
        info!(target = "konnect.api", "OPENAI_API_KEY not set; keyword parser only");
    }
    let messenger = TwilioMessenger::new(config.twilio.clone(), http_client.clone());
    if !messenger.is_live() {
        warn!(target = "konnect.api", "Twilio credentials missing; replies are only logged");
    }

    let pipeline = Pipeline::new(
        config.pipeline_settings(),
        store,
        parser,
        media,
        Arc::new(messenger),
    )?;
    let (queue, _worker) = JobQueue::spawn(pipeline.clone(), config.queue_capacity);
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = config.redis_url.as_deref().and_then(|url| {
        redis::Client::open(url)
            .map_err(|err| warn!(target = "konnect.api", error = %err, "invalid REDIS_URL"))
            .ok()
    });

    let state = AppState {
        pipeline,
        queue,
        dedupe: MessageDeduper::new(redis, config.idempotency_ttl),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
        openapi_key: config.openapi_key.clone(),
        metrics_key: config.metrics_key.clone(),
    };
    let app = app(state, BridgeAuth::from_env(), config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "konnect.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: JobQueue,
    dedupe: MessageDeduper,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    openapi_key: Option<String>,
    metrics_key: Option<String>,
}

fn app(state: AppState, auth: BridgeAuth, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/messages", post(handle_bridge_message))
        .nest(
            "/jobs",
            Router::new()
                .route("/messages", post(enqueue_message_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_bridge_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route(
            "/whatsapp/incoming",
            get(whatsapp_liveness).post(whatsapp_incoming),
        )
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(OPENAPI_YAML).unwrap_or_else(|err| {
        warn!(target = "konnect.api", error = %err, "openapi document did not parse");
        json!({ "openapi": "3.0.3" })
    })
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "konnect-bot-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if !key_gate_allows(&headers, "X-Docs-Key", state.openapi_key.as_deref()) {
        return Err(AppError::Unauthorized("docs"));
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Konnect Bot API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !key_gate_allows(&headers, "X-Metrics-Key", state.metrics_key.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

async fn whatsapp_liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "WhatsApp webhook endpoint is active",
    }))
}

/// Twilio WhatsApp webhook.
///
/// - Method: `POST`
/// - Path: `/whatsapp/incoming`
/// - Body: `application/x-www-form-urlencoded` Twilio fields
/// - Response: empty TwiML; replies are sent through the Messages API
async fn whatsapp_incoming(
    State(state): State<AppState>,
    Form(form): Form<TwilioWebhookForm>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/whatsapp/incoming");
    let Some(message) = form.into_inbound() else {
        return Err(AppError::BadRequest(ApiError::new(
            "missing_fields",
            "Missing required fields: From and Body",
        )));
    };

    let sid = message.message_id.clone();
    if let Some(sid) = sid.as_deref()
        && !state.dedupe.first_delivery(sid).await
    {
        debug!(target = "konnect.api", message_sid = sid, "duplicate_delivery_skipped");
        return Ok(twiml_ack());
    }

    if let Err(err) = state.queue.enqueue(message).await {
        // Twilio retries on 5xx; the retry must not look like a duplicate.
        if let Some(sid) = sid.as_deref() {
            state.dedupe.release(sid).await;
        }
        return Err(AppError::Unavailable(err));
    }
    Ok(twiml_ack())
}

fn twiml_ack() -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response()
}

/// Run the pipeline inline for a chat bridge and hand back the replies.
///
/// - Method: `POST`
/// - Path: `/messages`
/// - Auth: `Authorization: Bearer <key>` or `X-Konnect-Key: <key>`
/// - Body: `BridgeMessageRequest`
/// - Response: `BridgeMessageResponse`
async fn handle_bridge_message(
    State(state): State<AppState>,
    Extension(bridge): Extension<BridgeIdentity>,
    Json(payload): Json<BridgeMessageRequest>,
) -> Json<BridgeMessageResponse> {
    crate::metrics::inc_requests("/messages");
    info!(
        target = "konnect.api",
        bridge = %bridge.name,
        api_key = %bridge.key_id,
        "bridge_message_received"
    );
    let collector = ReplyCollector::new();
    let messenger: Arc<dyn Messenger> = Arc::new(collector.clone());
    let outcome = state.pipeline.handle_with(payload.into(), messenger).await;
    Json(BridgeMessageResponse {
        outcome,
        replies: collector.take().await,
    })
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_message_job(
    State(state): State<AppState>,
    Json(payload): Json<BridgeMessageRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/messages");
    let id = state
        .queue
        .enqueue_collecting(payload.into())
        .await
        .map_err(AppError::Unavailable)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest(ApiError::new(
            "invalid_job_id",
            "job id must be a UUID",
        )));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(ApiError::new("not_found", id)))
}

#[derive(Debug)]
enum AppError {
    BadRequest(ApiError),
    Unauthorized(&'static str),
    NotFound(ApiError),
    Unavailable(ApiError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err),
            AppError::Unauthorized(area) => (
                StatusCode::UNAUTHORIZED,
                ApiError::new("unauthorized", format!("{area} key missing or wrong")),
            ),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err),
            AppError::Unavailable(err) => (StatusCode::SERVICE_UNAVAILABLE, err),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpTimeouts, build_client};
    use crate::pipeline::PipelineSettings;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::FixedOffset;
    use std::time::Duration;
    use tower::ServiceExt;

    const BRIDGE_KEY: &str = "bridge-secret";

    struct TestApp {
        router: Router,
        store: MemoryStore,
        outbound: ReplyCollector,
        dedupe: MessageDeduper,
        worker: tokio::task::JoinHandle<()>,
    }

    fn test_app(metrics_key: Option<&str>) -> TestApp {
        let store = MemoryStore::with_default_cities();
        let outbound = ReplyCollector::new();
        let pipeline = Pipeline::new(
            PipelineSettings {
                app_url: "https://indiankonnect.com".into(),
                daily_post_limit: 5,
                free_post_limit: 100,
                trigger_keywords: vec!["post".into(), "konnect".into()],
                rate_limit_offset: FixedOffset::east_opt(0).unwrap(),
            },
            Arc::new(store.clone()),
            MessageParser::deterministic(),
            MediaProcessor::new(
                Arc::new(MemoryBlobStore::new()),
                build_client(HttpTimeouts::default()),
            ),
            Arc::new(outbound.clone()),
        )
        .unwrap();
        let (queue, worker) = JobQueue::spawn(pipeline.clone(), 8);
        let dedupe = MessageDeduper::local(Duration::from_secs(60));
        let state = AppState {
            pipeline,
            queue,
            dedupe: dedupe.clone(),
            openapi: Arc::new(load_openapi()),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            openapi_key: None,
            metrics_key: metrics_key.map(str::to_string),
        };
        TestApp {
            router: app(
                state,
                BridgeAuth::from_spec(&format!("test-bridge:{BRIDGE_KEY}")),
                64 * 1024,
            ),
            store,
            outbound,
            dedupe,
            worker,
        }
    }

    fn twilio_form(body: &str) -> Request<Body> {
        Request::post("/whatsapp/incoming")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bridge_json(path: &str, payload: serde_json::Value) -> Request<Body> {
        Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header(security::BRIDGE_KEY_HEADER, BRIDGE_KEY)
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for_replies(outbound: &ReplyCollector, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let replies = outbound.replies().await;
            if replies.len() >= count {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        outbound.replies().await
    }

    #[tokio::test]
    async fn health_and_openapi_are_public() {
        let app = test_app(None);
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");

        let response = app
            .router
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["paths"]["/whatsapp/incoming"].is_object());
    }

    #[tokio::test]
    async fn webhook_requires_from_and_body() {
        let app = test_app(None);
        let response = app
            .router
            .oneshot(twilio_form("From=whatsapp%3A%2B14165550199"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "missing_fields");
    }

    #[tokio::test]
    async fn webhook_acknowledges_with_twiml_and_posts_once() {
        let app = test_app(None);
        let form = "From=whatsapp%3A%2B14165550199&Body=post+Selling+a+sofa+in+good+condition+%24120&MessageSid=SM42";
        for _ in 0..2 {
            let response = app.router.clone().oneshot(twilio_form(form)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], EMPTY_TWIML.as_bytes());
        }

        let replies = wait_for_replies(&app.outbound, 1).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("/posts/"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(app.store.posts().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_the_sid_unclaimed() {
        let mut app = test_app(None);
        app.worker.abort();
        let _ = (&mut app.worker).await;

        let form = "From=whatsapp%3A%2B14165550199&Body=post+Selling+a+sofa&MessageSid=SM77";
        let response = app.router.clone().oneshot(twilio_form(form)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(app.dedupe.first_delivery("SM77").await);
    }

    #[tokio::test]
    async fn bridge_routes_require_a_key() {
        let app = test_app(None);
        let response = app
            .router
            .oneshot(
                Request::post("/messages")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "from": "+14165550199", "body": "post sofa" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn bridge_message_returns_outcome_and_replies() {
        let app = test_app(None);
        let response = app
            .router
            .oneshot(bridge_json(
                "/messages",
                json!({
                    "from": "14165550199@c.us",
                    "body": "konnect Room available in Brampton, ₹650/month, veg only",
                    "is_forwarded": false
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "posted");
        assert_eq!(body["sender"], "+*******0199");
        let replies = body["replies"].as_array().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].as_str().unwrap().contains("/posts/"));
        assert!(app.outbound.replies().await.is_empty());
    }

    #[tokio::test]
    async fn jobs_can_be_enqueued_and_polled() {
        let app = test_app(None);
        let response = app
            .router
            .clone()
            .oneshot(bridge_json(
                "/jobs/messages",
                json!({ "from": "+14165550199", "body": "post" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let mut last = serde_json::Value::Null;
        for _ in 0..100 {
            let response = app
                .router
                .clone()
                .oneshot(
                    Request::get(format!("/jobs/{job_id}"))
                        .header(security::BRIDGE_KEY_HEADER, BRIDGE_KEY)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            last = json_body(response).await;
            if last["state"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["state"], "completed");
        assert_eq!(last["outcome"]["code"], "text_empty");
        assert_eq!(last["replies"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_job_ids_are_rejected() {
        let app = test_app(None);
        let response = app
            .router
            .oneshot(
                Request::get("/jobs/not-a-uuid")
                    .header(security::BRIDGE_KEY_HEADER, BRIDGE_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_key_is_enforced_when_configured() {
        let app = test_app(Some("m-key"));
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .router
            .oneshot(
                Request::get("/metrics")
                    .header("X-Metrics-Key", "m-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

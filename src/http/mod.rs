//! Axum surface: state, router assembly, auth, and dialect error shapes.

pub mod admin;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::RwLock;
use tower::Layer as _;

use crate::config::RelayConfig;
use crate::failover::{LogOutcomeSink, OutcomeSink, RetryPolicy};
use crate::keypool::{KeyPool, SharedKeyPool};
use crate::pacing::StreamPacer;
use crate::upstream::{GeminiClient, KeyAuth};
use crate::{RelayError, Result};

/// Which credential family (and upstream) a route is backed by. The two
/// families never mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamKind {
    Gemini,
    VertexExpress,
}

#[derive(Clone)]
struct Clients {
    gemini: GeminiClient,
    vertex: GeminiClient,
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<RwLock<Arc<RelayConfig>>>,
    pool: SharedKeyPool,
    vertex_pool: SharedKeyPool,
    clients: Arc<RwLock<Clients>>,
    outcomes: Arc<dyn OutcomeSink>,
    admin_enabled: bool,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let clients = Clients {
            gemini: GeminiClient::new(&config.base_url, KeyAuth::GoogHeader, timeout)?,
            vertex: GeminiClient::new(&config.vertex_base_url, KeyAuth::QueryParam, timeout)?,
        };
        let pool = SharedKeyPool::new(KeyPool::new(config.api_keys.clone(), config.max_failures));
        let vertex_pool = SharedKeyPool::new(KeyPool::new(
            config.vertex_api_keys.clone(),
            config.max_failures,
        ));
        let admin_enabled = config.admin_token.is_some();
        Ok(Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            pool,
            vertex_pool,
            clients: Arc::new(RwLock::new(clients)),
            outcomes: Arc::new(LogOutcomeSink),
            admin_enabled,
        })
    }

    pub fn with_outcome_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.outcomes = sink;
        self
    }

    pub async fn config(&self) -> Arc<RelayConfig> {
        self.config.read().await.clone()
    }

    /// Hot reload: swap the config and rebuild clients, replacing both pools
    /// through the inheritance protocol so surviving keys keep their failure
    /// history and rotation position.
    pub async fn apply_config(&self, new: RelayConfig) -> Result<()> {
        let timeout = Duration::from_secs(new.timeout_seconds);
        let rebuilt = Clients {
            gemini: GeminiClient::new(&new.base_url, KeyAuth::GoogHeader, timeout)?,
            vertex: GeminiClient::new(&new.vertex_base_url, KeyAuth::QueryParam, timeout)?,
        };
        self.pool
            .replace(new.api_keys.clone(), new.max_failures)
            .await;
        self.vertex_pool
            .replace(new.vertex_api_keys.clone(), new.max_failures)
            .await;
        *self.clients.write().await = rebuilt;
        *self.config.write().await = Arc::new(new);
        tracing::info!("configuration replaced");
        Ok(())
    }

    pub fn pool_for(&self, kind: UpstreamKind) -> SharedKeyPool {
        match kind {
            UpstreamKind::Gemini => self.pool.clone(),
            UpstreamKind::VertexExpress => self.vertex_pool.clone(),
        }
    }

    pub async fn client_for(&self, kind: UpstreamKind) -> GeminiClient {
        let clients = self.clients.read().await;
        match kind {
            UpstreamKind::Gemini => clients.gemini.clone(),
            UpstreamKind::VertexExpress => clients.vertex.clone(),
        }
    }

    pub async fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config().await.max_retries)
    }

    /// A pacer when pacing is enabled; `None` means upstream chunks are
    /// forwarded verbatim and immediately.
    pub async fn pacer(&self) -> Option<StreamPacer> {
        let config = self.config().await;
        config
            .stream_pacing
            .enabled
            .then(|| StreamPacer::new(&config.stream_pacing))
    }

    pub fn outcomes(&self) -> Arc<dyn OutcomeSink> {
        self.outcomes.clone()
    }

    fn admin_enabled(&self) -> bool {
        self.admin_enabled
    }
}

pub fn router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/health", get(health))
        .route("/v1beta/models", get(gemini::list_models))
        .route("/v1beta/models/*path", post(gemini::model_action))
        .route("/gemini/v1beta/models", get(gemini::list_models))
        .route("/gemini/v1beta/models/*path", post(gemini::model_action))
        .route(
            "/vertex-express/v1beta/models",
            get(gemini::vertex_list_models),
        )
        .route(
            "/vertex-express/v1beta/models/*path",
            post(gemini::vertex_model_action),
        )
        .route(
            "/vertex-express/v1/chat/completions",
            post(openai::vertex_chat_completions),
        )
        .route(
            "/vertex-express/v1/embeddings",
            post(openai::vertex_embeddings),
        )
        .route(
            "/vertex-express/v1/images/generations",
            post(openai::vertex_image_generations),
        )
        .route("/vertex-express/v1/models", get(openai::vertex_list_models));

    for prefix in ["/v1", "/openai/v1", "/hf/v1"] {
        api = api
            .route(
                &format!("{prefix}/chat/completions"),
                post(openai::chat_completions),
            )
            .route(&format!("{prefix}/embeddings"), post(openai::embeddings))
            .route(
                &format!("{prefix}/images/generations"),
                post(openai::image_generations),
            )
            .route(
                &format!("{prefix}/audio/speech"),
                post(openai::audio_speech),
            )
            .route(&format!("{prefix}/models"), get(openai::list_models));
    }

    if state.admin_enabled() {
        api = api
            .route("/admin/keys/status", get(admin::keys_status))
            .route(
                "/admin/keys/reset-fail-counts",
                post(admin::reset_fail_counts),
            )
            .route("/admin/keys/:key/reset", post(admin::reset_key))
            .route("/admin/keys/:key/verify", post(admin::verify_key))
            .route("/admin/config", put(admin::replace_config));
    }

    // Normalization must run before route matching, so it wraps the whole
    // router instead of going through `Router::layer`.
    let api = api.with_state(state.clone());
    let normalized =
        axum::middleware::from_fn_with_state(state, crate::normalize::normalize_request).layer(api);
    Router::new().fallback_service(normalized)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.to_string(),
            },
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct GoogleApiErrorDetail {
    pub code: u16,
    pub message: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct GoogleApiErrorResponse {
    pub error: GoogleApiErrorDetail,
}

pub(crate) fn google_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<GoogleApiErrorResponse>) {
    let detail = if status == StatusCode::UNAUTHORIZED {
        "UNAUTHENTICATED"
    } else if status == StatusCode::NOT_FOUND {
        "NOT_FOUND"
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        "UNAVAILABLE"
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        "RESOURCE_EXHAUSTED"
    } else if status.is_server_error() {
        "INTERNAL"
    } else {
        "INVALID_ARGUMENT"
    };
    (
        status,
        Json(GoogleApiErrorResponse {
            error: GoogleApiErrorDetail {
                code: status.as_u16(),
                message: message.into(),
                status: detail,
            },
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorDetail,
}

pub(crate) fn openai_error(
    status: StatusCode,
    kind: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
            },
        }),
    )
}

/// Caller-visible status for a dispatch error: the upstream status when one
/// is derivable, 503 for an empty pool, 502 otherwise.
pub(crate) fn relay_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Api { status, .. } => *status,
        RelayError::EmptyPool => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::RetriesExhausted { source, .. } => relay_status(source),
        RelayError::Http(inner) => inner.status().unwrap_or(StatusCode::BAD_GATEWAY),
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub(crate) fn google_relay_error(err: &RelayError) -> (StatusCode, Json<GoogleApiErrorResponse>) {
    google_error(relay_status(err), err.to_string())
}

pub(crate) fn openai_relay_error(err: &RelayError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    openai_error(relay_status(err), "upstream_error", err)
}

pub(crate) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    extract_header(headers, "authorization")
        .and_then(|value| value.strip_prefix("Bearer ").map(str::trim).map(str::to_string))
        .filter(|token| !token.is_empty())
}

/// Caller auth: open when no tokens are configured; otherwise a bearer token,
/// `x-goog-api-key` header, or `key` query parameter must match.
pub(crate) async fn caller_allowed(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> bool {
    let config = state.config().await;
    if config.allowed_tokens.is_empty() {
        return true;
    }
    let token = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-goog-api-key"))
        .or_else(|| query.get("key").cloned());
    token.is_some_and(|token| config.allowed_tokens.contains(&token))
}

/// Turn the upstream event stream into an infallible one that terminates on
/// the first error: once a terminal error is decided no further frames are
/// emitted on the response.
pub(crate) fn terminated_events(
    events: BoxStream<'static, Result<String>>,
    errored: Arc<AtomicBool>,
) -> BoxStream<'static, String> {
    events
        .inspect(move |item| {
            if let Err(err) = item {
                errored.store(true, Ordering::Relaxed);
                tracing::warn!(error = %err, "upstream stream failed mid-response");
            }
        })
        .take_while(|item| std::future::ready(item.is_ok()))
        .filter_map(|item| std::future::ready(item.ok()))
        .boxed()
}

pub(crate) fn sse_response(frames: BoxStream<'static, Bytes>) -> Response {
    let body = Body::from_stream(frames.map(Ok::<_, std::io::Error>));
    let mut response = Response::new(body);
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    response
}

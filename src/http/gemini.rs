//! Native-dialect handlers: generate, stream-generate, count-tokens, and the
//! model catalog, for both the primary and the vertex express families.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use crate::failover::send_with_failover;
use crate::interop;
use crate::pacing::StreamPacer;

use super::{
    AppState, GoogleApiErrorResponse, UpstreamKind, caller_allowed, google_error,
    google_relay_error, sse_response, terminated_events,
};

type GoogleError = (StatusCode, Json<GoogleApiErrorResponse>);

pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GoogleError> {
    list_models_inner(state, headers, query, UpstreamKind::Gemini).await
}

pub async fn vertex_list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, GoogleError> {
    list_models_inner(state, headers, query, UpstreamKind::VertexExpress).await
}

async fn list_models_inner(
    state: AppState,
    headers: HeaderMap,
    query: HashMap<String, String>,
    kind: UpstreamKind,
) -> Result<Json<Value>, GoogleError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(google_error(StatusCode::UNAUTHORIZED, "invalid api token"));
    }
    // Catalog reads do not need load distribution; take the first valid key.
    let pool = state.pool_for(kind).current().await;
    let key = pool.first_valid_key().await.ok_or_else(|| {
        google_error(StatusCode::SERVICE_UNAVAILABLE, "no api keys configured")
    })?;
    let client = state.client_for(kind).await;
    let models = client
        .list_models(&key)
        .await
        .map_err(|err| google_relay_error(&err))?;
    Ok(Json(models))
}

pub async fn model_action(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match model_action_inner(state, UpstreamKind::Gemini, path, query, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn vertex_model_action(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match model_action_inner(state, UpstreamKind::VertexExpress, path, query, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn model_action_inner(
    state: AppState,
    kind: UpstreamKind,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GoogleError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(google_error(StatusCode::UNAUTHORIZED, "invalid api token"));
    }
    let (model_raw, action) = path
        .rsplit_once(':')
        .ok_or_else(|| google_error(StatusCode::NOT_FOUND, "unsupported endpoint"))?;
    let model = model_raw.trim().trim_start_matches("models/").to_string();
    if model.is_empty() {
        return Err(google_error(StatusCode::BAD_REQUEST, "missing model name"));
    }
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| google_error(StatusCode::BAD_REQUEST, format!("invalid JSON: {err}")))?;

    match action {
        "generateContent" => generate(state, kind, model, payload).await,
        "streamGenerateContent" => stream_generate(state, kind, model, payload).await,
        "countTokens" if kind == UpstreamKind::Gemini => {
            count_tokens(state, model, payload).await
        }
        other => Err(google_error(
            StatusCode::NOT_FOUND,
            format!("unsupported action: {other}"),
        )),
    }
}

async fn generate(
    state: AppState,
    kind: UpstreamKind,
    model: String,
    payload: Value,
) -> Result<Response, GoogleError> {
    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;
    let policy = state.retry_policy().await;
    let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.generate_content(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| google_relay_error(&err))?;
    Ok(Json(response).into_response())
}

async fn count_tokens(
    state: AppState,
    model: String,
    payload: Value,
) -> Result<Response, GoogleError> {
    let pool = state.pool_for(UpstreamKind::Gemini).current().await;
    let client = state.client_for(UpstreamKind::Gemini).await;
    let policy = state.retry_policy().await;
    let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.count_tokens(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| google_relay_error(&err))?;
    Ok(Json(response).into_response())
}

async fn stream_generate(
    state: AppState,
    kind: UpstreamKind,
    model: String,
    payload: Value,
) -> Result<Response, GoogleError> {
    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;
    let policy = state.retry_policy().await;
    // Failover covers establishing the stream; once frames flow, a mid-stream
    // failure terminates the response instead of restarting it.
    let upstream = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.stream_generate_content(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| google_relay_error(&err))?;

    let errored = Arc::new(AtomicBool::new(false));
    let events = terminated_events(upstream, errored);
    let pacer = state.pacer().await;
    let frames: BoxStream<'static, Bytes> = match pacer {
        Some(pacer) => events
            .flat_map(move |data| event_frames(data, &pacer))
            .boxed(),
        None => events
            .map(|data| Bytes::from(format!("data: {data}\n\n")))
            .boxed(),
    };
    Ok(sse_response(frames))
}

/// Expand one upstream event into paced frames. Events without candidate text
/// (safety blocks, usage-only tails) are forwarded verbatim.
fn event_frames(data: String, pacer: &StreamPacer) -> BoxStream<'static, Bytes> {
    let parsed: Option<Value> = serde_json::from_str(&data).ok();
    match parsed.as_ref().and_then(interop::candidate_text) {
        Some(text) => pacer
            .pace(
                &text,
                |piece| interop::gemini_text_chunk(&piece),
                |chunk| interop::sse_frame(&chunk),
            )
            .map(Bytes::from)
            .boxed(),
        None => stream::once(std::future::ready(Bytes::from(format!("data: {data}\n\n"))))
            .boxed(),
    }
}

//! OpenAI-dialect handlers. Requests are reshaped onto the native API, sent
//! through the same failover path, and reshaped back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use crate::failover::{now_millis, send_with_failover};
use crate::interop;
use crate::pacing::StreamPacer;

use super::{
    AppState, OpenAiErrorResponse, UpstreamKind, caller_allowed, openai_error,
    openai_relay_error, sse_response, terminated_events,
};

type OpenAiError = (StatusCode, Json<OpenAiErrorResponse>);

pub async fn chat_completions(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match chat_completions_inner(state, UpstreamKind::Gemini, headers, query, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn vertex_chat_completions(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match chat_completions_inner(state, UpstreamKind::VertexExpress, headers, query, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn chat_completions_inner(
    state: AppState,
    kind: UpstreamKind,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<Response, OpenAiError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid api token",
        ));
    }
    let request: Value = parse_body(&body)?;
    let (model, payload, stream) = interop::openai_chat_to_generate_content(&request)
        .map_err(|err| openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", err))?;

    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;
    let policy = state.retry_policy().await;

    if !stream {
        let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
            let client = client.clone();
            let model = model.clone();
            let payload = payload.clone();
            async move { client.generate_content(&model, &key, &payload).await }
        })
        .await
        .map_err(|err| openai_relay_error(&err))?;
        let id = format!("chatcmpl-{}", now_millis());
        let created = now_millis() / 1000;
        return Ok(Json(interop::generate_content_to_openai_chat(
            &model, &response, &id, created,
        ))
        .into_response());
    }

    let upstream = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.stream_generate_content(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| openai_relay_error(&err))?;

    let errored = Arc::new(AtomicBool::new(false));
    let events = terminated_events(upstream, errored.clone());
    let pacer = state.pacer().await;
    let id: Arc<str> = format!("chatcmpl-{}", now_millis()).into();
    let created = now_millis() / 1000;
    let model: Arc<str> = model.into();

    let frames = {
        let id = id.clone();
        let model = model.clone();
        events
            .flat_map(move |data| {
                chunk_frames(data, pacer.as_ref(), id.clone(), created, model.clone())
            })
            .boxed()
    };
    // `[DONE]` only after a clean completion; a terminated stream stays
    // terminated.
    let tail = stream::once(std::future::ready(())).filter_map(move |_| {
        let errored = errored.clone();
        std::future::ready(
            (!errored.load(Ordering::Relaxed)).then(|| Bytes::from("data: [DONE]\n\n")),
        )
    });
    Ok(sse_response(frames.chain(tail).boxed()))
}

/// Map one upstream event onto OpenAI chunk frames: paced per-piece deltas
/// when pacing is on, one delta otherwise, then a terminal chunk when the
/// event carries a finish reason.
fn chunk_frames(
    data: String,
    pacer: Option<&StreamPacer>,
    id: Arc<str>,
    created: u64,
    model: Arc<str>,
) -> BoxStream<'static, Bytes> {
    let Ok(event) = serde_json::from_str::<Value>(&data) else {
        return stream::empty().boxed();
    };
    let text = interop::candidate_text(&event);
    let mut tail = Vec::<Bytes>::new();
    if let Some(reason) = interop::openai_finish_reason(&event) {
        tail.push(Bytes::from(interop::sse_frame(&interop::openai_chunk(
            &id,
            created,
            &model,
            None,
            Some(reason),
        ))));
    }
    match text {
        Some(text) => match pacer {
            Some(pacer) => pacer
                .pace(
                    &text,
                    move |piece| interop::openai_chunk(&id, created, &model, Some(&piece), None),
                    |chunk| interop::sse_frame(&chunk),
                )
                .map(Bytes::from)
                .chain(stream::iter(tail))
                .boxed(),
            None => {
                let delta = Bytes::from(interop::sse_frame(&interop::openai_chunk(
                    &id,
                    created,
                    &model,
                    Some(&text),
                    None,
                )));
                stream::iter(std::iter::once(delta).chain(tail)).boxed()
            }
        },
        None => stream::iter(tail).boxed(),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    embeddings_inner(state, UpstreamKind::Gemini, headers, query, body).await
}

pub async fn vertex_embeddings(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    embeddings_inner(state, UpstreamKind::VertexExpress, headers, query, body).await
}

async fn embeddings_inner(
    state: AppState,
    kind: UpstreamKind,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid api token",
        ));
    }
    let request: Value = parse_body(&body)?;
    let (model, payload) = interop::openai_embeddings_to_batch_embed(&request)
        .map_err(|err| openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", err))?;

    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;
    let policy = state.retry_policy().await;
    let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.batch_embed(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| openai_relay_error(&err))?;
    Ok(Json(interop::batch_embed_to_openai(&model, &response)))
}

pub async fn image_generations(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    image_generations_inner(state, UpstreamKind::Gemini, headers, query, body).await
}

pub async fn vertex_image_generations(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    image_generations_inner(state, UpstreamKind::VertexExpress, headers, query, body).await
}

async fn image_generations_inner(
    state: AppState,
    kind: UpstreamKind,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<Json<Value>, OpenAiError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid api token",
        ));
    }
    let request: Value = parse_body(&body)?;
    let (model, payload) = interop::openai_images_to_predict(&request)
        .map_err(|err| openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", err))?;

    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;
    let policy = state.retry_policy().await;
    let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.predict(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| openai_relay_error(&err))?;
    Ok(Json(interop::predict_to_openai_images(
        &response,
        now_millis() / 1000,
    )))
}

pub async fn audio_speech(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match audio_speech_inner(state, headers, query, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn audio_speech_inner(
    state: AppState,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<Response, OpenAiError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid api token",
        ));
    }
    let request: Value = parse_body(&body)?;
    let (model, payload) = interop::openai_speech_to_generate_content(&request)
        .map_err(|err| openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", err))?;

    let pool = state.pool_for(UpstreamKind::Gemini).current().await;
    let client = state.client_for(UpstreamKind::Gemini).await;
    let policy = state.retry_policy().await;
    let response = send_with_failover(&pool, policy, state.outcomes(), &model, |key| {
        let client = client.clone();
        let model = model.clone();
        let payload = payload.clone();
        async move { client.generate_content(&model, &key, &payload).await }
    })
    .await
    .map_err(|err| openai_relay_error(&err))?;

    let (mime, bytes) = interop::speech_response_audio(&response)
        .map_err(|err| openai_error(StatusCode::BAD_GATEWAY, "upstream_error", err))?;
    let mut out = Response::new(bytes.into());
    out.headers_mut().insert(
        "content-type",
        HeaderValue::from_str(&mime)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok(out)
}

pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, OpenAiError> {
    list_models_inner(state, UpstreamKind::Gemini, headers, query).await
}

pub async fn vertex_list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, OpenAiError> {
    list_models_inner(state, UpstreamKind::VertexExpress, headers, query).await
}

async fn list_models_inner(
    state: AppState,
    kind: UpstreamKind,
    headers: HeaderMap,
    query: HashMap<String, String>,
) -> Result<Json<Value>, OpenAiError> {
    if !caller_allowed(&state, &headers, &query).await {
        return Err(openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid api token",
        ));
    }
    let pool = state.pool_for(kind).current().await;
    let key = pool.first_valid_key().await.ok_or_else(|| {
        openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_error",
            "no api keys configured",
        )
    })?;
    let client = state.client_for(kind).await;
    let models = client
        .list_models(&key)
        .await
        .map_err(|err| openai_relay_error(&err))?;
    Ok(Json(interop::models_to_openai(&models, now_millis() / 1000)))
}

fn parse_body(body: &Bytes) -> Result<Value, OpenAiError> {
    serde_json::from_slice(body).map_err(|err| {
        openai_error(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("invalid JSON: {err}"),
        )
    })
}

//! Admin surface: key health, failure-count lifecycle, key verification, and
//! hot config replacement. Mounted only when an admin token is configured.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RelayConfig;
use crate::keypool::{KeyPoolStatus, redact_key};
use crate::scheduler::probe_payload;

use super::{AppState, ErrorResponse, UpstreamKind, error_response, extract_header};

type AdminError = (StatusCode, Json<ErrorResponse>);

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AdminError> {
    let config = state.config().await;
    let expected = config.admin_token.as_deref().unwrap_or_default();
    let provided = extract_header(headers, "x-admin-token").unwrap_or_default();
    if expected.is_empty() || provided != expected {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin token",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PoolSelector {
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    key_type: Option<String>,
}

fn selected_kind(selector: &PoolSelector) -> Result<UpstreamKind, AdminError> {
    match selector.pool.as_deref() {
        None | Some("gemini") => Ok(UpstreamKind::Gemini),
        Some("vertex") => Ok(UpstreamKind::VertexExpress),
        Some(other) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_pool",
            format!("unknown pool: {other}"),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct KeysStatusResponse {
    pub gemini: KeyPoolStatus,
    pub vertex: KeyPoolStatus,
}

pub async fn keys_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<KeysStatusResponse>, AdminError> {
    require_admin(&state, &headers).await?;
    let gemini = state.pool_for(UpstreamKind::Gemini).current().await;
    let vertex = state.pool_for(UpstreamKind::VertexExpress).current().await;
    Ok(Json(KeysStatusResponse {
        gemini: gemini.status().await,
        vertex: vertex.status().await,
    }))
}

pub async fn reset_fail_counts(
    State(state): State<AppState>,
    Query(selector): Query<PoolSelector>,
    headers: HeaderMap,
) -> Result<Json<Value>, AdminError> {
    require_admin(&state, &headers).await?;
    let kind = selected_kind(&selector)?;
    let pool = state.pool_for(kind).current().await;

    let keys_to_reset: Vec<String> = match selector.key_type.as_deref() {
        None => {
            pool.reset_all().await;
            return Ok(Json(
                json!({ "success": true, "message": "failure counts reset for all keys" }),
            ));
        }
        Some("valid") => pool.status().await.valid.into_keys().collect(),
        Some("invalid") => pool.status().await.invalid.into_keys().collect(),
        Some(other) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_key_type",
                format!("unknown key_type: {other}"),
            ));
        }
    };
    let mut reset_count = 0usize;
    for key in &keys_to_reset {
        if pool.reset_failure(key).await {
            reset_count += 1;
        }
    }
    Ok(Json(json!({ "success": true, "reset_count": reset_count })))
}

pub async fn reset_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(selector): Query<PoolSelector>,
    headers: HeaderMap,
) -> Result<Json<Value>, AdminError> {
    require_admin(&state, &headers).await?;
    let kind = selected_kind(&selector)?;
    let pool = state.pool_for(kind).current().await;
    if pool.reset_failure(&key).await {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(error_response(
            StatusCode::NOT_FOUND,
            "unknown_key",
            "specified key not found",
        ))
    }
}

/// Probe one key against the test model through the regular transport; clear
/// its failure count on success, record a failure otherwise.
pub async fn verify_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(selector): Query<PoolSelector>,
    headers: HeaderMap,
) -> Result<Json<Value>, AdminError> {
    require_admin(&state, &headers).await?;
    let kind = selected_kind(&selector)?;
    let config = state.config().await;
    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;

    match client
        .generate_content(&config.test_model, &key, &probe_payload())
        .await
    {
        Ok(_) => {
            pool.reset_failure(&key).await;
            Ok(Json(json!({ "status": "valid" })))
        }
        Err(err) => {
            tracing::warn!(key = %redact_key(&key), error = %err, "key verification failed");
            pool.record_failure(&key).await;
            Ok(Json(json!({ "status": "invalid", "error": err.to_string() })))
        }
    }
}

pub async fn replace_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<RelayConfig>,
) -> Result<Json<Value>, AdminError> {
    require_admin(&state, &headers).await?;
    state.apply_config(new).await.map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, "invalid_config", err)
    })?;
    Ok(Json(json!({ "success": true })))
}

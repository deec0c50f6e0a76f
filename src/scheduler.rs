//! Periodic re-validation of keys with recorded failures. Reuses the key
//! pool and upstream transport verbatim; no separate failure bookkeeping.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::http::{AppState, UpstreamKind};
use crate::keypool::redact_key;

/// Minimal probe request used by the checker and the admin verify endpoint.
pub fn probe_payload() -> Value {
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
        "generationConfig": { "temperature": 0.7, "topP": 1.0, "maxOutputTokens": 10 },
    })
}

pub fn spawn_key_checker(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let period = state.config().await.key_check.interval_seconds.max(1);
            tokio::time::sleep(Duration::from_secs(period)).await;
            check_failed_keys(&state).await;
        }
    })
}

/// Probe every key with a failure count above zero; a successful probe resets
/// the count, a failed one increments it while below the threshold.
pub async fn check_failed_keys(state: &AppState) {
    for kind in [UpstreamKind::Gemini, UpstreamKind::VertexExpress] {
        check_pool(state, kind).await;
    }
}

async fn check_pool(state: &AppState, kind: UpstreamKind) {
    let config = state.config().await;
    let pool = state.pool_for(kind).current().await;
    let client = state.client_for(kind).await;

    let status = pool.status().await;
    let suspects: Vec<String> = status
        .valid
        .into_iter()
        .chain(status.invalid)
        .filter(|(_, count)| *count > 0)
        .map(|(key, _)| key)
        .collect();
    if suspects.is_empty() {
        return;
    }
    tracing::info!(kind = ?kind, keys = suspects.len(), "re-validating keys with failures");

    for key in suspects {
        match client
            .generate_content(&config.test_model, &key, &probe_payload())
            .await
        {
            Ok(_) => {
                tracing::info!(key = %redact_key(&key), "key probe succeeded, clearing failures");
                pool.reset_failure(&key).await;
            }
            Err(err) => {
                tracing::warn!(key = %redact_key(&key), error = %err, "key probe failed");
                if pool.fail_count(&key).await < pool.max_failures() {
                    pool.record_failure(&key).await;
                }
            }
        }
    }
}

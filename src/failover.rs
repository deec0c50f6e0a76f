//! Retry orchestration: wraps one unit of upstream work and substitutes keys
//! from the pool until it succeeds or the retry budget runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::keypool::{KeyPool, redact_key};
use crate::{RelayError, Result};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

/// One attempt's outcome, handed to the logging collaborator. The key is
/// stored in redacted form.
#[derive(Clone, Debug)]
pub struct RequestOutcome {
    pub model: String,
    pub key: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub timestamp_ms: u64,
}

/// Fire-and-forget outcome collaborator. Kept synchronous so the drop guard
/// can emit during cancellation; implementations that persist must enqueue
/// internally and may never fail the request.
pub trait OutcomeSink: Send + Sync {
    fn record_outcome(&self, outcome: RequestOutcome);
}

/// Default sink: a structured tracing event per attempt.
#[derive(Debug, Default)]
pub struct LogOutcomeSink;

impl OutcomeSink for LogOutcomeSink {
    fn record_outcome(&self, outcome: RequestOutcome) {
        tracing::info!(
            model = %outcome.model,
            key = %outcome.key,
            success = outcome.success,
            status = ?outcome.status_code,
            latency_ms = outcome.latency_ms,
            "request outcome"
        );
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Guarantees an outcome record per attempt: if the attempt future is dropped
/// mid-flight (client disconnect, deadline) the guard still emits a failure.
struct OutcomeGuard {
    sink: Arc<dyn OutcomeSink>,
    model: String,
    key: String,
    started: Instant,
    reported: bool,
}

impl OutcomeGuard {
    fn new(sink: Arc<dyn OutcomeSink>, model: &str, key: &str) -> Self {
        Self {
            sink,
            model: model.to_string(),
            key: redact_key(key),
            started: Instant::now(),
            reported: false,
        }
    }

    fn emit(&self, success: bool, status_code: Option<u16>) {
        self.sink.record_outcome(RequestOutcome {
            model: self.model.clone(),
            key: self.key.clone(),
            success,
            status_code,
            latency_ms: self.started.elapsed().as_millis() as u64,
            timestamp_ms: now_millis(),
        });
    }

    fn report(mut self, success: bool, status_code: Option<u16>) {
        self.reported = true;
        self.emit(success, status_code);
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.reported {
            self.emit(false, None);
        }
    }
}

/// Run `attempt` with a working key from the pool, recording a failure and
/// rotating to the next working key on every error, bounded by the retry
/// budget. Any upstream error is retryable; the policy does not distinguish
/// status codes. For streaming work the closure must cover establishing the
/// stream only, so a retry never happens after output has been flushed.
pub async fn send_with_failover<T, F, Fut>(
    pool: &KeyPool,
    policy: RetryPolicy,
    sink: Arc<dyn OutcomeSink>,
    model: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut key = pool.next_working_key().await.ok_or(RelayError::EmptyPool)?;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let guard = OutcomeGuard::new(sink.clone(), model, &key);
        match attempt(key.clone()).await {
            Ok(value) => {
                guard.report(true, None);
                return Ok(value);
            }
            Err(err) => {
                guard.report(false, err.status_code());
                pool.record_failure(&key).await;
                tracing::warn!(
                    model,
                    key = %redact_key(&key),
                    attempt = attempts,
                    error = %err,
                    "upstream attempt failed"
                );
                if attempts >= policy.max_attempts {
                    return Err(RelayError::RetriesExhausted {
                        attempts,
                        last_key: redact_key(&key),
                        source: Box::new(err),
                    });
                }
                key = match pool.next_working_key().await {
                    Some(next) => next,
                    None => {
                        return Err(RelayError::RetriesExhausted {
                            attempts,
                            last_key: redact_key(&key),
                            source: Box::new(err),
                        });
                    }
                };
            }
        }
    }
}

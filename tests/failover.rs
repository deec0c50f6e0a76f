use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use gemini_relay::{
    KeyPool, OutcomeSink, RelayError, RequestOutcome, RetryPolicy, send_with_failover,
};

#[derive(Default)]
struct CollectSink {
    records: Mutex<Vec<RequestOutcome>>,
}

impl CollectSink {
    fn records(&self) -> Vec<RequestOutcome> {
        self.records.lock().expect("sink lock").clone()
    }
}

impl OutcomeSink for CollectSink {
    fn record_outcome(&self, outcome: RequestOutcome) {
        self.records.lock().expect("sink lock").push(outcome);
    }
}

fn pool_of(keys: &[&str]) -> KeyPool {
    KeyPool::new(keys.iter().map(|key| key.to_string()).collect(), 3)
}

#[tokio::test]
async fn two_failures_then_success_rotates_keys() {
    let pool = pool_of(&["k1", "k2", "k3"]);
    let sink = Arc::new(CollectSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result = send_with_failover(&pool, RetryPolicy::new(3), sink.clone(), "gemini-pro", |key| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RelayError::InvalidResponse(format!("boom on {key}")))
            } else {
                Ok(key)
            }
        }
    })
    .await;

    // Third attempt succeeds on the third distinct key.
    assert_eq!(result.expect("success"), "k3");
    assert_eq!(pool.fail_count("k1").await, 1);
    assert_eq!(pool.fail_count("k2").await, 1);
    assert_eq!(pool.fail_count("k3").await, 0);

    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(!records[0].success);
    assert!(!records[1].success);
    assert!(records[2].success);
    assert_eq!(records[0].model, "gemini-pro");
}

#[tokio::test]
async fn budget_exhaustion_propagates_the_last_error() {
    let pool = pool_of(&["k1"]);
    let sink = Arc::new(CollectSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> =
        send_with_failover(&pool, RetryPolicy::new(3), sink.clone(), "gemini-pro", |_key| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::InvalidResponse("always down".to_string()))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result.expect_err("must fail") {
        RelayError::RetriesExhausted { attempts, source, .. } => {
            assert_eq!(attempts, 3);
            assert!(source.to_string().contains("always down"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sink.records().len(), 3);
}

#[tokio::test]
async fn upstream_status_is_recorded_on_failure_outcomes() {
    let pool = pool_of(&["k1"]);
    let sink = Arc::new(CollectSink::default());

    let _ = send_with_failover(&pool, RetryPolicy::new(1), sink.clone(), "gemini-pro", |_key| {
        async move {
            Err::<(), _>(RelayError::Api {
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                body: "quota".to_string(),
            })
        }
    })
    .await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, Some(429));
    assert!(records[0].key.contains("k1"));
}

#[tokio::test]
async fn empty_pool_fails_without_attempting() {
    let pool = pool_of(&[]);
    let sink = Arc::new(CollectSink::default());

    let result =
        send_with_failover(&pool, RetryPolicy::new(3), sink.clone(), "gemini-pro", |key| async move {
            Ok(key)
        })
        .await;

    assert!(matches!(result, Err(RelayError::EmptyPool)));
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn keys_exhausted_mid_flight_still_respects_the_budget() {
    // One key, threshold 1: after the first failure the pool has no valid key
    // left, but the bounded working-key scan still hands one back and the
    // budget governs termination.
    let pool = KeyPool::new(vec!["k1".to_string()], 1);
    let sink = Arc::new(CollectSink::default());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> =
        send_with_failover(&pool, RetryPolicy::new(2), sink.clone(), "gemini-pro", |_key| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::InvalidResponse("down".to_string()))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(matches!(result, Err(RelayError::RetriesExhausted { .. })));
}

use gemini_relay::{KeyPool, SharedKeyPool};

fn pool_of(keys: &[&str], max_failures: u32) -> KeyPool {
    KeyPool::new(keys.iter().map(|key| key.to_string()).collect(), max_failures)
}

#[tokio::test]
async fn rotation_visits_each_key_once_per_cycle() {
    let pool = pool_of(&["a", "b", "c"], 3);
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(pool.next_key().await.expect("key"));
    }
    assert_eq!(seen, ["a", "b", "c"]);
    // The cycle wraps back to the first key.
    assert_eq!(pool.next_key().await.as_deref(), Some("a"));
}

#[tokio::test]
async fn next_key_on_empty_pool_is_none() {
    let pool = pool_of(&[], 3);
    assert!(pool.next_key().await.is_none());
    assert!(pool.next_working_key().await.is_none());
    assert!(pool.first_valid_key().await.is_none());
}

#[tokio::test]
async fn working_key_skips_invalid_keys() {
    let pool = pool_of(&["a", "b", "c"], 2);
    pool.record_failure("a").await;
    pool.record_failure("a").await;
    // "a" is now at the threshold; the first working key after it is "b".
    assert_eq!(pool.next_working_key().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn working_key_terminates_when_every_key_is_invalid() {
    let pool = pool_of(&["a", "b", "c"], 1);
    for key in ["a", "b", "c"] {
        pool.record_failure(key).await;
    }
    // Bounded scan: one full cycle, then best effort.
    let key = pool.next_working_key().await.expect("still returns a key");
    assert!(["a", "b", "c"].contains(&key.as_str()));
}

#[tokio::test]
async fn failure_bookkeeping_and_status_partition() {
    let pool = pool_of(&["a", "b"], 2);
    pool.record_failure("a").await;
    pool.record_failure("a").await;
    pool.record_failure("b").await;
    // Unknown keys are a logged no-op, never an error.
    pool.record_failure("ghost").await;
    assert!(!pool.reset_failure("ghost").await);

    let status = pool.status().await;
    assert_eq!(status.invalid.get("a"), Some(&2));
    assert_eq!(status.valid.get("b"), Some(&1));

    assert!(pool.reset_failure("a").await);
    assert_eq!(pool.fail_count("a").await, 0);

    pool.record_failure("b").await;
    pool.reset_all().await;
    assert_eq!(pool.status().await.invalid.len(), 0);
}

#[tokio::test]
async fn first_valid_key_uses_list_order_and_degrades() {
    let pool = pool_of(&["a", "b", "c"], 1);
    // Rotation position must not affect the answer.
    pool.next_key().await;
    pool.next_key().await;
    assert_eq!(pool.first_valid_key().await.as_deref(), Some("a"));

    pool.record_failure("a").await;
    assert_eq!(pool.first_valid_key().await.as_deref(), Some("b"));

    pool.record_failure("b").await;
    pool.record_failure("c").await;
    // Nothing valid: fall back to the first key overall.
    assert_eq!(pool.first_valid_key().await.as_deref(), Some("a"));
}

#[tokio::test]
async fn reconfiguration_preserves_counts_and_rotation_position() {
    let old = pool_of(&["a", "b", "c"], 3);
    old.record_failure("a").await;
    old.record_failure("a").await;
    old.record_failure("c").await;
    // Advance so the next key to be returned is "b".
    assert_eq!(old.next_key().await.as_deref(), Some("a"));

    let snapshot = old.snapshot().await;
    assert_eq!(snapshot.next_hint.as_deref(), Some("b"));

    let new = KeyPool::from_snapshot(
        vec!["b".to_string(), "c".to_string(), "d".to_string()],
        3,
        &snapshot,
    );
    assert_eq!(new.fail_count("b").await, 0);
    assert_eq!(new.fail_count("c").await, 1);
    assert_eq!(new.fail_count("d").await, 0);
    // Rotation resumes at the closest surviving successor of the old "next".
    assert_eq!(new.next_key().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn reconfiguration_skips_dropped_keys_when_resuming() {
    let old = pool_of(&["a", "b", "c"], 3);
    // Next hint is "a", which the new list drops; the scan wraps forward to
    // the first survivor, "c".
    let snapshot = old.snapshot().await;
    assert_eq!(snapshot.next_hint.as_deref(), Some("a"));

    let new = KeyPool::from_snapshot(vec!["c".to_string(), "d".to_string()], 3, &snapshot);
    assert_eq!(new.next_key().await.as_deref(), Some("c"));
}

#[tokio::test]
async fn reconfiguration_with_no_survivors_starts_at_zero() {
    let old = pool_of(&["a", "b"], 3);
    let snapshot = old.snapshot().await;
    let new = KeyPool::from_snapshot(vec!["x".to_string(), "y".to_string()], 3, &snapshot);
    assert_eq!(new.next_key().await.as_deref(), Some("x"));
}

#[tokio::test]
async fn shared_pool_replace_goes_through_inheritance() {
    let shared = SharedKeyPool::new(pool_of(&["a", "b", "c"], 3));
    {
        let pool = shared.current().await;
        pool.record_failure("c").await;
        assert_eq!(pool.next_key().await.as_deref(), Some("a"));
    }
    shared
        .replace(vec!["b".to_string(), "c".to_string(), "d".to_string()], 3)
        .await;
    let pool = shared.current().await;
    assert_eq!(pool.fail_count("c").await, 1);
    assert_eq!(pool.next_key().await.as_deref(), Some("b"));
}

//! Rotating pool of upstream API keys with failure-threshold bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

/// One family of upstream credentials. The rotation cursor and the failure
/// counters are guarded by independent mutexes since they are read and
/// written independently; neither critical section performs I/O.
pub struct KeyPool {
    keys: Vec<String>,
    next_index: Mutex<usize>,
    failure_counts: Mutex<HashMap<String, u32>>,
    max_failures: u32,
}

/// Partition of the pool by the validity predicate, for the admin surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyPoolStatus {
    pub valid: BTreeMap<String, u32>,
    pub invalid: BTreeMap<String, u32>,
}

/// State captured from an outgoing pool so a replacement can inherit the
/// failure history and rotation position of the keys that survive the edit.
#[derive(Clone, Debug)]
pub struct PoolSnapshot {
    pub keys: Vec<String>,
    pub failure_counts: HashMap<String, u32>,
    pub next_hint: Option<String>,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, max_failures: u32) -> Self {
        let mut deduped: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.trim().to_string();
            if key.is_empty() || deduped.contains(&key) {
                continue;
            }
            deduped.push(key);
        }
        let failure_counts = deduped.iter().map(|key| (key.clone(), 0)).collect();
        Self {
            keys: deduped,
            next_index: Mutex::new(0),
            failure_counts: Mutex::new(failure_counts),
            max_failures: max_failures.max(1),
        }
    }

    /// Build a replacement pool, carrying over failure counts for keys present
    /// in both lists and resuming rotation at the closest surviving successor
    /// of the old pool's next key. When the old next key cannot be located the
    /// new pool starts at position 0.
    pub fn from_snapshot(keys: Vec<String>, max_failures: u32, prior: &PoolSnapshot) -> Self {
        let mut pool = Self::new(keys, max_failures);
        {
            let counts = pool.failure_counts.get_mut();
            for (key, count) in &prior.failure_counts {
                if let Some(slot) = counts.get_mut(key) {
                    *slot = *count;
                }
            }
        }
        if let Some(resume) = resume_key(prior, &pool.keys) {
            if let Some(position) = pool.keys.iter().position(|key| *key == resume) {
                *pool.next_index.get_mut() = position;
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Advance the rotation cursor and return the key it lands on. Pure
    /// rotation: validity is not consulted.
    pub async fn next_key(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let mut index = self.next_index.lock().await;
        let key = self.keys[*index].clone();
        *index = (*index + 1) % self.keys.len();
        Some(key)
    }

    async fn peek_next_key(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.next_index.lock().await;
        Some(self.keys[*index].clone())
    }

    pub async fn is_valid(&self, key: &str) -> bool {
        let counts = self.failure_counts.lock().await;
        counts.get(key).is_some_and(|count| *count < self.max_failures)
    }

    /// Rotate until a valid key turns up, giving up after one full cycle and
    /// returning the last key visited. Bounded: never spins when the whole
    /// pool is exhausted.
    pub async fn next_working_key(&self) -> Option<String> {
        let initial = self.next_key().await?;
        let mut current = initial.clone();
        loop {
            if self.is_valid(&current).await {
                return Some(current);
            }
            current = self.next_key().await?;
            if current == initial {
                return Some(current);
            }
        }
    }

    pub async fn record_failure(&self, key: &str) {
        let mut counts = self.failure_counts.lock().await;
        match counts.get_mut(key) {
            Some(count) => {
                *count += 1;
                if *count >= self.max_failures {
                    tracing::warn!(
                        key = %redact_key(key),
                        failures = *count,
                        "key reached the failure threshold"
                    );
                }
            }
            None => {
                tracing::warn!(key = %redact_key(key), "failure recorded for unknown key");
            }
        }
    }

    /// Clear the failure count for one key. Returns whether the key exists.
    pub async fn reset_failure(&self, key: &str) -> bool {
        let mut counts = self.failure_counts.lock().await;
        match counts.get_mut(key) {
            Some(count) => {
                *count = 0;
                true
            }
            None => {
                tracing::warn!(key = %redact_key(key), "reset requested for unknown key");
                false
            }
        }
    }

    pub async fn reset_all(&self) {
        let mut counts = self.failure_counts.lock().await;
        for count in counts.values_mut() {
            *count = 0;
        }
    }

    pub async fn fail_count(&self, key: &str) -> u32 {
        let counts = self.failure_counts.lock().await;
        counts.get(key).copied().unwrap_or(0)
    }

    pub async fn status(&self) -> KeyPoolStatus {
        let counts = self.failure_counts.lock().await;
        let mut status = KeyPoolStatus::default();
        for key in &self.keys {
            let count = counts.get(key).copied().unwrap_or(0);
            if count < self.max_failures {
                status.valid.insert(key.clone(), count);
            } else {
                status.invalid.insert(key.clone(), count);
            }
        }
        status
    }

    /// First key (in list order, not rotation order) below the threshold; the
    /// first key overall when none is valid. Used by reads that do not need
    /// load distribution.
    pub async fn first_valid_key(&self) -> Option<String> {
        let counts = self.failure_counts.lock().await;
        for key in &self.keys {
            if counts.get(key).is_some_and(|count| *count < self.max_failures) {
                return Some(key.clone());
            }
        }
        self.keys.first().cloned()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let failure_counts = self.failure_counts.lock().await.clone();
        let next_hint = self.peek_next_key().await;
        PoolSnapshot {
            keys: self.keys.clone(),
            failure_counts,
            next_hint,
        }
    }
}

fn resume_key(prior: &PoolSnapshot, new_keys: &[String]) -> Option<String> {
    let hint = prior.next_hint.as_deref()?;
    let start = prior.keys.iter().position(|key| key == hint)?;
    let len = prior.keys.len();
    (0..len)
        .map(|offset| &prior.keys[(start + offset) % len])
        .find(|candidate| new_keys.contains(candidate))
        .cloned()
}

/// Cloneable handle to the process-wide pool of one credential family. All
/// replacement goes through [`SharedKeyPool::replace`] so the inheritance
/// protocol cannot be bypassed.
#[derive(Clone)]
pub struct SharedKeyPool {
    inner: Arc<RwLock<Arc<KeyPool>>>,
}

impl SharedKeyPool {
    pub fn new(pool: KeyPool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(pool))),
        }
    }

    pub async fn current(&self) -> Arc<KeyPool> {
        self.inner.read().await.clone()
    }

    /// Swap in a pool built from a new key list, inheriting failure counts and
    /// rotation position for keys that survive the edit.
    pub async fn replace(&self, keys: Vec<String>, max_failures: u32) {
        let mut slot = self.inner.write().await;
        let prior = slot.snapshot().await;
        *slot = Arc::new(KeyPool::from_snapshot(keys, max_failures, &prior));
        tracing::info!(keys = slot.len(), "key pool replaced");
    }
}

/// Display form for keys in logs and errors: `abcd...wxyz`.
pub fn redact_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_key_keeps_short_keys() {
        assert_eq!(redact_key("short"), "short");
        assert_eq!(redact_key("abcdefghijkl"), "abcd...ijkl");
    }

    #[test]
    fn construction_drops_blank_and_duplicate_keys() {
        let pool = KeyPool::new(
            vec![
                "a".to_string(),
                "".to_string(),
                " a ".to_string(),
                "b".to_string(),
            ],
            3,
        );
        assert_eq!(pool.keys(), ["a".to_string(), "b".to_string()]);
    }
}

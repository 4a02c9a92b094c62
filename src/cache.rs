//! Query Cache
//!
//! Successful translations keyed by normalized question, prior-turn context and schema version.
//! Cache population is serialized per key so concurrent duplicates wait for the first caller
//! instead of repeating the model call and the warehouse scan.

use crate::execution::ExecutionResult;
use crate::prompt::ConversationTurn;
use crate::validation::ValidatedQuery;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lowercase, collapse whitespace, drop trailing punctuation.
pub fn normalize_question(question: &str) -> String {
    let collapsed = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| matches!(c, '?' | '.' | '!'))
        .trim_end()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `context` should be the turns the prompt actually shows the model.
    pub fn new(question: &str, context: &[ConversationTurn], schema_version: &str) -> Self {
        let context = context
            .iter()
            .map(|turn| {
                // SQL keeps its case: string literals are case-sensitive.
                let sql = turn
                    .sql
                    .as_deref()
                    .map(|sql| sql.split_whitespace().collect::<Vec<_>>().join(" "))
                    .unwrap_or_default();
                format!("{} => {}", normalize_question(&turn.question), sql)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        CacheKey(format!(
            "{}\u{1f}{}\u{1f}{}",
            schema_version,
            context,
            normalize_question(question)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub query: ValidatedQuery,
    pub result: ExecutionResult,
    pub schema_version: String,
    pub created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_usable(&self, schema_version: &str, now: Instant) -> bool {
        self.schema_version == schema_version && now < self.expires_at
    }
}

/// Holds the per-key population lock; the lock slot is dropped once nobody else wants it.
pub struct KeyGuard<'a> {
    cache: &'a QueryCache,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.cache
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct QueryCache {
    entries: DashMap<CacheKey, CacheEntry>,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            ttl,
        }
    }

    /// Fresh entry for `key` under `schema_version`. Stale entries are evicted on the way.
    pub fn get(&self, key: &CacheKey, schema_version: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let hit = self.entries.get(key).map(|entry| entry.value().clone())?;
        if hit.is_usable(schema_version, now) {
            return Some(hit);
        }
        self.entries
            .remove_if(key, |_, entry| !entry.is_usable(schema_version, now));
        debug!("Evicted stale cache entry");
        None
    }

    /// Store a successful translation; a later successful write for the same key replaces it.
    /// Expired entries under any key are swept first.
    pub fn insert(
        &self,
        key: CacheKey,
        query: ValidatedQuery,
        result: ExecutionResult,
        schema_version: &str,
    ) {
        let created_at = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| created_at < entry.expires_at);
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!("Swept {} expired cache entries", swept);
        }
        self.entries.insert(
            key,
            CacheEntry {
                query,
                result,
                schema_version: schema_version.to_string(),
                created_at,
                expires_at: created_at + self.ttl,
            },
        );
    }

    /// Wait for exclusive population rights on `key`.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            cache: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Drop entries built against any other schema version.
    pub fn retain_version(&self, schema_version: &str) {
        self.entries
            .retain(|_, entry| entry.schema_version == schema_version);
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.locks.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_locks(&self) -> usize {
        self.locks.len()
    }
}

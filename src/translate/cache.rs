//! In-memory translation cache with lazy expiry and approximate-LFU eviction.
//! Key: blake3 hash over length-prefixed (src_lang, tgt_lang, normalized text).
//! Capacity: 1000, max age: 24h. An optional durable tier backs the fast tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::normalize::normalize_for_key;
use super::sqlite_cache::{DurableCache, DurableWrite};

pub type CacheKey = [u8; 32];

/// A cached translation as handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTranslation {
    pub translated_text: String,
    pub confidence: f64,
    pub hit_count: u64,
}

struct CacheEntry {
    translated_text: String,
    confidence: f64,
    /// Fixed at first write. Promoted durable rows keep their original deadline.
    expires_at: Instant,
    hit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct TranslationCache {
    inner: Mutex<Inner>,
    capacity: usize,
    max_age: Duration,
    evict_fraction: f64,
    durable: Option<Arc<DurableCache>>,
}

impl TranslationCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            max_age,
            evict_fraction: 0.10,
            durable: None,
        }
    }

    pub fn with_evict_fraction(mut self, fraction: f64) -> Self {
        self.evict_fraction = fraction.clamp(0.0, 0.5);
        self
    }

    /// Attach a durable tier. Fast-tier misses fall through to it and writes
    /// are queued to it without blocking the caller.
    pub fn with_durable(mut self, durable: Arc<DurableCache>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Compute the cache key. Each part is length-prefixed so no choice of
    /// text can collide with a different language pair.
    pub fn compute_key(text: &str, src_lang: &str, tgt_lang: &str) -> CacheKey {
        let normalized = normalize_for_key(text);
        let mut hasher = blake3::Hasher::new();
        for part in [src_lang, tgt_lang, normalized.as_str()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    /// Look up a translation. Entries older than max age are treated as absent.
    pub async fn get(
        &self,
        text: &str,
        src_lang: &str,
        tgt_lang: &str,
    ) -> Option<CachedTranslation> {
        let key = Self::compute_key(text, src_lang, tgt_lang);
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut expired = false;
            if let Some(entry) = inner.entries.get_mut(&key) {
                if now < entry.expires_at {
                    entry.hit_count += 1;
                    let found = CachedTranslation {
                        translated_text: entry.translated_text.clone(),
                        confidence: entry.confidence,
                        hit_count: entry.hit_count,
                    };
                    inner.hits += 1;
                    debug!(src_lang, tgt_lang, "translation cache hit");
                    return Some(found);
                }
                expired = true;
            }
            if expired {
                inner.entries.remove(&key);
            }
            if self.durable.is_none() {
                inner.misses += 1;
                return None;
            }
        }

        let promoted = match &self.durable {
            Some(durable) => durable
                .get(&key, self.max_age)
                .await
                .filter(|hit| hit.age < self.max_age),
            None => None,
        };

        let mut inner = self.inner.lock();
        match promoted {
            Some(hit) => {
                inner.hits += 1;
                debug!(src_lang, tgt_lang, age_secs = hit.age.as_secs(), "durable cache hit, promoting");
                let remaining = self.max_age - hit.age;
                self.insert_locked(
                    &mut inner,
                    key,
                    hit.translated_text.clone(),
                    hit.confidence,
                    1,
                    remaining,
                );
                Some(CachedTranslation {
                    translated_text: hit.translated_text,
                    confidence: hit.confidence,
                    hit_count: 1,
                })
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store a translation in the fast tier and queue it for the durable tier.
    pub fn put(
        &self,
        text: &str,
        translated_text: &str,
        src_lang: &str,
        tgt_lang: &str,
        confidence: f64,
    ) {
        let key = Self::compute_key(text, src_lang, tgt_lang);
        {
            let mut inner = self.inner.lock();
            self.insert_locked(
                &mut inner,
                key,
                translated_text.to_string(),
                confidence,
                0,
                self.max_age,
            );
        }

        if let Some(durable) = &self.durable {
            durable.enqueue(DurableWrite {
                key,
                translated_text: translated_text.to_string(),
                src_lang: src_lang.to_string(),
                tgt_lang: tgt_lang.to_string(),
                confidence,
            });
        }
    }

    fn insert_locked(
        &self,
        inner: &mut Inner,
        key: CacheKey,
        translated_text: String,
        confidence: f64,
        hit_count: u64,
        ttl: Duration,
    ) {
        inner.entries.insert(
            key,
            CacheEntry {
                translated_text,
                confidence,
                expires_at: Instant::now() + ttl,
                hit_count,
            },
        );
        if inner.entries.len() > self.capacity {
            self.evict_locked(inner, &key);
        }
    }

    /// Bring the fast tier back under capacity minus the eviction margin.
    /// Expired entries go first, then the least-hit ones (soonest to expire
    /// on ties).
    /// The entry that triggered eviction is never chosen.
    fn evict_locked(&self, inner: &mut Inner, keep: &CacheKey) {
        let now = Instant::now();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|k, e| k == keep || now < e.expires_at);

        let margin = ((self.capacity as f64 * self.evict_fraction) as usize).max(1);
        let target = self.capacity.saturating_sub(margin);
        if inner.entries.len() > self.capacity {
            let excess = inner.entries.len() - target;
            let mut ranked: Vec<(u64, Instant, CacheKey)> = inner
                .entries
                .iter()
                .filter(|(k, _)| *k != keep)
                .map(|(k, e)| (e.hit_count, e.expires_at, *k))
                .collect();
            ranked.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
            for (_, _, k) in ranked.into_iter().take(excess) {
                inner.entries.remove(&k);
            }
        }

        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        info!(removed, size = inner.entries.len(), "translation cache eviction");
    }

    /// Physically drop expired entries. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| now < e.expires_at);
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total_requests = inner.hits + inner.misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            inner.hits as f64 / total_requests as f64
        };
        CacheStats {
            total_requests,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
            size: inner.entries.len(),
            capacity: self.capacity,
            evictions: inner.evictions,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep of both tiers.
    pub fn start_sweep_loop(
        cache: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let removed = cache.sweep_expired();
                if removed > 0 {
                    info!(removed, "translation cache sweep");
                }
                if let Some(durable) = &cache.durable {
                    durable.cleanup_expired(cache.max_age);
                }
            }
            debug!("translation cache sweep loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let cache = TranslationCache::new(10, DAY);
        cache.put("Hello", "Hola", "en", "es", 0.85);
        let hit = cache.get("Hello", "en", "es").await.unwrap();
        assert_eq!(hit.translated_text, "Hola");
        assert_eq!(hit.confidence, 0.85);
        assert_eq!(hit.hit_count, 1);
    }

    #[tokio::test]
    async fn key_normalizes_case_and_whitespace() {
        let cache = TranslationCache::new(10, DAY);
        cache.put("  Hello World ", "Hola Mundo", "en", "es", 0.85);
        assert!(cache.get("hello world", "en", "es").await.is_some());
    }

    #[tokio::test]
    async fn language_pair_is_part_of_key() {
        let cache = TranslationCache::new(10, DAY);
        cache.put("Hello", "Hola", "en", "es", 0.85);
        assert!(cache.get("Hello", "en", "fr").await.is_none());
        assert!(cache.get("Hello", "auto", "es").await.is_none());
    }

    #[test]
    fn key_has_no_delimiter_collisions() {
        let a = TranslationCache::compute_key("x", "en|es", "fr");
        let b = TranslationCache::compute_key("x", "en", "es|fr");
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_max_age() {
        let cache = TranslationCache::new(10, DAY);
        cache.put("Hello", "Hola", "en", "es", 0.85);
        tokio::time::advance(DAY - Duration::from_secs(1)).await;
        assert!(cache.get("Hello", "en", "es").await.is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("Hello", "en", "es").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_expired_entries() {
        let cache = TranslationCache::new(10, DAY);
        cache.put("a", "A", "en", "es", 0.9);
        cache.put("b", "B", "en", "es", 0.9);
        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        cache.put("c", "C", "en", "es", 0.9);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_keeps_size_within_capacity() {
        let cache = TranslationCache::new(100, DAY);
        for i in 0..150 {
            cache.put(&format!("text {i}"), "t", "en", "es", 0.9);
            assert!(cache.len() <= 100);
        }
        // one pass drops the overflow plus a 10% margin
        assert!(cache.len() >= 90);
        assert!(cache.stats().evictions > 0);
    }

    #[tokio::test]
    async fn eviction_prefers_least_hit_entries() {
        let cache = TranslationCache::new(10, DAY);
        for i in 0..10 {
            cache.put(&format!("text {i}"), "t", "en", "es", 0.9);
        }
        for i in 0..5 {
            for _ in 0..3 {
                cache.get(&format!("text {i}"), "en", "es").await;
            }
        }
        cache.put("overflow", "t", "en", "es", 0.9);

        assert!(cache.len() <= 10);
        for i in 0..5 {
            assert!(
                cache.get(&format!("text {i}"), "en", "es").await.is_some(),
                "hot entry {i} was evicted"
            );
        }
        assert!(cache.get("overflow", "en", "es").await.is_some());
    }

    #[tokio::test]
    async fn hit_rate_arithmetic() {
        let cache = TranslationCache::new(10, DAY);
        assert_eq!(cache.stats().hit_rate, 0.0);
        assert_eq!(cache.stats().total_requests, 0);

        cache.put("Hello", "Hola", "en", "es", 0.85);
        cache.get("Hello", "en", "es").await;
        cache.get("Hello", "en", "es").await;
        cache.get("Goodbye", "en", "es").await;

        let stats = cache.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn promoted_rows_keep_their_original_deadline() {
        let durable = DurableCache::open_in_memory().unwrap();
        let key = TranslationCache::compute_key("Hello", "en", "it");
        durable.write_batch_aged(
            &[DurableWrite {
                key,
                translated_text: "Ciao".into(),
                src_lang: "en".into(),
                tgt_lang: "it".into(),
                confidence: 0.85,
            }],
            DAY - Duration::from_secs(60),
        );

        let cache = TranslationCache::new(10, DAY).with_durable(durable);
        assert!(cache.get("Hello", "en", "it").await.is_some());
        assert_eq!(cache.len(), 1);

        // about a minute of life left, not a fresh day
        tokio::time::advance(Duration::from_secs(58)).await;
        assert_eq!(cache.sweep_expired(), 0);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.sweep_expired(), 1);
    }

    #[tokio::test]
    async fn durable_tier_serves_fast_tier_misses() {
        let durable = DurableCache::open_in_memory().unwrap();
        let key = TranslationCache::compute_key("Hello", "en", "de");
        durable.write_batch(&[DurableWrite {
            key,
            translated_text: "Hallo".into(),
            src_lang: "en".into(),
            tgt_lang: "de".into(),
            confidence: 0.85,
        }]);

        let cache = TranslationCache::new(10, DAY).with_durable(durable);
        let hit = cache.get("Hello", "en", "de").await.unwrap();
        assert_eq!(hit.translated_text, "Hallo");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 1);
    }
}

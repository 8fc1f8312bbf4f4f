use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::config::CacheConfig;
use super::interface::{
    BufferedProvider, ProviderKind, SynthesisRequest, SynthesisResult, TimingEntry, VoiceProfile,
};

/// LRU-based synthesis cache with TTL expiration.
///
/// Cache key is derived from (chunk text, voice, provider id, rate).
/// Timings are stored relative to the chunk so a hit can be rebased onto
/// whatever position the same text appears at.
pub struct SynthesisCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
    /// Access order for LRU eviction (most recently used at the end)
    access_order: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    text: String,
    voice_id: String,
    provider_id: String,
    /// Rate × 100 as integer for hashing
    rate_centis: i32,
}

struct CacheEntry {
    audio: Arc<Vec<u8>>,
    /// `(word offset within chunk, audio offset ms)`
    timings: Vec<(usize, u64)>,
    length: usize,
    created_at: Instant,
}

impl CacheKey {
    pub fn new(text: &str, voice_id: &str, provider_id: &str, rate: f32) -> Self {
        Self {
            text: text.to_string(),
            voice_id: voice_id.to_string(),
            provider_id: provider_id.to_string(),
            rate_centis: (rate * 100.0).round() as i32,
        }
    }

    fn for_request(request: &SynthesisRequest, provider_id: &str) -> Self {
        Self::new(
            &request.chunk_words().join(" "),
            request.voice.as_deref().unwrap_or(""),
            provider_id,
            request.rate,
        )
    }
}

impl SynthesisCache {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            ttl: Duration::from_secs(ttl_secs),
            access_order: Vec::new(),
        }
    }

    /// Cached result rebased to `start_index`. None if not found or expired.
    pub fn get(&mut self, key: &CacheKey, start_index: usize) -> Option<SynthesisResult> {
        let entry = self.entries.get(key)?;
        if entry.created_at.elapsed() > self.ttl {
            self.entries.remove(key);
            self.access_order.retain(|k| k != key);
            return None;
        }
        let result = SynthesisResult {
            audio: Arc::clone(&entry.audio),
            timings: entry
                .timings
                .iter()
                .map(|&(offset, ms)| TimingEntry {
                    word_index: start_index + offset,
                    audio_offset_ms: ms,
                })
                .collect(),
            start_index,
            length: entry.length,
        };
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.clone());
        Some(result)
    }

    /// Store a result. Evicts LRU entries if over capacity.
    pub fn put(&mut self, key: CacheKey, result: &SynthesisResult) {
        while self.entries.len() >= self.max_entries && !self.access_order.is_empty() {
            let oldest = self.access_order.remove(0);
            self.entries.remove(&oldest);
        }

        let timings = result
            .timings
            .iter()
            .filter_map(|t| {
                t.word_index
                    .checked_sub(result.start_index)
                    .map(|offset| (offset, t.audio_offset_ms))
            })
            .collect();
        self.access_order.retain(|k| k != &key);
        self.access_order.push(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                audio: Arc::clone(&result.audio),
                timings,
                length: result.length,
                created_at: Instant::now(),
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wraps a buffered provider with a [`SynthesisCache`].
pub struct CachedProvider {
    inner: Arc<dyn BufferedProvider>,
    cache: Mutex<SynthesisCache>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn BufferedProvider>, config: &CacheConfig) -> Self {
        Self {
            inner,
            cache: Mutex::new(SynthesisCache::new(config.max_entries, config.ttl_secs)),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, SynthesisCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear(&self) {
        self.cache().clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache().len()
    }
}

#[async_trait]
impl BufferedProvider for CachedProvider {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn voices(&self) -> Vec<VoiceProfile> {
        self.inner.voices().await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> Option<SynthesisResult> {
        let key = CacheKey::for_request(request, &self.inner.id());
        let cached = self.cache().get(&key, request.start_index);
        if let Some(hit) = cached {
            if hit.length == request.length {
                tracing::debug!(start = request.start_index, "synthesis cache hit");
                return Some(hit);
            }
        }

        let result = self.inner.synthesize(request, cancel).await?;
        self.cache().put(key, &result);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BufferedProvider for CountingProvider {
        fn id(&self) -> String {
            "counting".into()
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::LocalServer
        }
        async fn voices(&self) -> Vec<VoiceProfile> {
            Vec::new()
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn synthesize(&self, request: &SynthesisRequest, _cancel: &CancelToken) -> Option<SynthesisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(SynthesisResult {
                audio: Arc::new(vec![1, 2, 3]),
                timings: (0..request.length)
                    .map(|i| TimingEntry {
                        word_index: request.start_index + i,
                        audio_offset_ms: i as u64 * 100,
                    })
                    .collect(),
                start_index: request.start_index,
                length: request.length,
            })
        }
    }

    fn request(text: &str, start: usize, len: usize, rate: f32) -> SynthesisRequest {
        SynthesisRequest {
            words: text.split_whitespace().map(str::to_string).collect(),
            start_index: start,
            length: len,
            voice: Some("v".into()),
            rate,
        }
    }

    #[tokio::test]
    async fn repeated_text_is_served_from_cache_and_rebased() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedProvider::new(inner.clone(), &CacheConfig::default());
        let cancel = CancelToken::new();

        // "go now" appears at 0 and at 3
        let first = cached
            .synthesize(&request("go now . go now", 0, 2, 1.0), &cancel)
            .await
            .unwrap();
        let second = cached
            .synthesize(&request("go now . go now", 3, 2, 1.0), &cancel)
            .await
            .unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.timings[1].word_index, 1);
        assert_eq!(second.start_index, 3);
        assert_eq!(
            second.timings,
            vec![
                TimingEntry { word_index: 3, audio_offset_ms: 0 },
                TimingEntry { word_index: 4, audio_offset_ms: 100 },
            ]
        );
    }

    #[tokio::test]
    async fn rate_is_part_of_the_key() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedProvider::new(inner.clone(), &CacheConfig::default());
        let cancel = CancelToken::new();
        cached.synthesize(&request("a b", 0, 2, 1.0), &cancel).await;
        cached.synthesize(&request("a b", 0, 2, 1.5), &cancel).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.cached_entries(), 2);
        cached.clear();
        assert_eq!(cached.cached_entries(), 0);
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = SynthesisCache::new(2, 3600);
        let result = SynthesisResult {
            audio: Arc::new(vec![0]),
            timings: Vec::new(),
            start_index: 0,
            length: 1,
        };
        let a = CacheKey::new("a", "v", "p", 1.0);
        let b = CacheKey::new("b", "v", "p", 1.0);
        let c = CacheKey::new("c", "v", "p", 1.0);
        cache.put(a.clone(), &result);
        cache.put(b.clone(), &result);
        assert!(cache.get(&a, 0).is_some());
        cache.put(c.clone(), &result);
        assert!(cache.get(&b, 0).is_none());
        assert!(cache.get(&a, 0).is_some());
        assert!(cache.get(&c, 0).is_some());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let mut cache = SynthesisCache::new(4, 0);
        let result = SynthesisResult {
            audio: Arc::new(vec![0]),
            timings: Vec::new(),
            start_index: 0,
            length: 1,
        };
        let key = CacheKey::new("a", "v", "p", 1.0);
        cache.put(key.clone(), &result);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key, 0).is_none());
        assert!(cache.is_empty());
    }
}

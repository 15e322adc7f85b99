//! # Filler Cache
//!
//! Synthesized audio for short stock phrases ("Sure.", "Let me think.") that come up
//! again and again across connections. The cache never evicts: entries are written
//! once, usually during prewarm, and read by every turn afterwards.
//!
//! ## Key Components:
//! - **FillerCache**: `put` / `get` keyed by trimmed sentence text
//! - **CachedSynthesizer**: a [`Synthesizer`] that answers from the cache when it can

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::inference::{CollaboratorError, Synthesizer};

#[derive(Debug, Clone, Default)]
pub struct FillerCache {
    entries: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

fn cache_key(text: &str) -> String {
    text.trim().to_string()
}

impl FillerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store audio for `text`, replacing any previous entry.
    pub async fn put(&self, text: &str, audio: Vec<u8>) {
        self.entries
            .write()
            .await
            .insert(cache_key(text), Arc::new(audio));
    }

    pub async fn get(&self, text: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.read().await.get(&cache_key(text)).cloned()
    }

    pub async fn contains(&self, text: &str) -> bool {
        self.entries.read().await.contains_key(&cache_key(text))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Synthesize every sentence that is not cached yet.
    ///
    /// ## Returns:
    /// - **Ok(n)**: number of sentences newly synthesized
    /// - **Err**: the first synthesis failure; entries stored before it are kept
    pub async fn prefill(
        &self,
        synthesizer: &dyn Synthesizer,
        sentences: &[String],
    ) -> Result<usize, CollaboratorError> {
        let mut added = 0;
        for sentence in sentences {
            if sentence.trim().is_empty() || self.contains(sentence).await {
                continue;
            }
            let audio = synthesizer.synthesize(sentence).await?;
            self.put(sentence, audio).await;
            added += 1;
        }
        info!(added, total = self.len().await, "Filler cache prefilled");
        Ok(added)
    }
}

/// Answers from a [`FillerCache`] first and delegates misses.
pub struct CachedSynthesizer {
    inner: Arc<dyn Synthesizer>,
    cache: FillerCache,
}

impl CachedSynthesizer {
    pub fn new(inner: Arc<dyn Synthesizer>, cache: FillerCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Synthesizer for CachedSynthesizer {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        self.inner.warm().await
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        if let Some(audio) = self.cache.get(text).await {
            debug!(text = text.trim(), "Filler cache hit");
            return Ok(audio.as_ref().clone());
        }
        self.inner.synthesize(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSynthesizer;

    #[tokio::test]
    async fn test_put_get_trims_key() {
        let cache = FillerCache::new();
        assert!(cache.get("Sure.").await.is_none());

        cache.put("Sure. ", vec![1, 2, 3]).await;
        assert_eq!(cache.get("Sure.").await.unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_prefill_skips_cached_sentences() {
        let cache = FillerCache::new();
        cache.put("Sure.", vec![9]).await;
        let synthesizer = MockSynthesizer::new();

        let sentences = vec!["Sure.".to_string(), "Let me think.".to_string(), " ".to_string()];
        let added = cache.prefill(&synthesizer, &sentences).await.unwrap();

        assert_eq!(added, 1);
        assert_eq!(synthesizer.calls(), 1);
        assert_eq!(cache.get("Sure.").await.unwrap().as_slice(), &[9]);
        assert!(cache.contains("Let me think.").await);
    }

    #[tokio::test]
    async fn test_cached_synthesizer_hits_and_misses() {
        let cache = FillerCache::new();
        cache.put("Okay.", vec![7, 7]).await;
        let inner = Arc::new(MockSynthesizer::new());
        let synthesizer = CachedSynthesizer::new(inner.clone(), cache);

        assert_eq!(synthesizer.synthesize("Okay. ").await.unwrap(), vec![7, 7]);
        assert_eq!(inner.calls(), 0);

        let audio = synthesizer.synthesize("Something new. ").await.unwrap();
        assert_eq!(audio, b"audio:Something new.".to_vec());
        assert_eq!(inner.calls(), 1);
    }
}

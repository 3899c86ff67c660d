//! Speech synthesis dispatch with a content-fingerprint cache.
//!
//! Every spoken reply is keyed by a fingerprint of (text, locale, voice).
//! Identical content replays from the cache without touching the backend,
//! and concurrent requests for the same key collapse into a single
//! backend call behind a per-key gate. A periodic reaper drops artifacts
//! past their TTL unless a live call still references them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::backend::{BackendError, SpeechBackend};
use crate::config::SynthesisConfig;
use crate::locale::Locale;
use crate::metrics::Metrics;

/// Stable fingerprint for one piece of synthesized audio. Same text in a
/// different locale or voice keys differently.
pub fn artifact_key(text: &str, locale: Locale, voice: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(locale.tag().as_bytes());
    hasher.update([0u8]);
    hasher.update(voice.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AudioArtifact {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

struct CacheEntry {
    artifact: Arc<AudioArtifact>,
    created: Instant,
}

pub struct SynthesisDispatcher {
    backend: Arc<dyn SpeechBackend>,
    default_voice: String,
    voice_overrides: HashMap<String, String>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
    // Per-key gates so concurrent misses produce one backend call.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<Metrics>,
}

impl SynthesisDispatcher {
    pub fn new(
        config: &SynthesisConfig,
        backend: Arc<dyn SpeechBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            default_voice: config.voice.clone(),
            voice_overrides: config.voice_overrides.clone(),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn voice_for(&self, locale: Locale) -> &str {
        self.voice_overrides
            .get(locale.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_voice)
    }

    /// Audio for the given text, from cache when possible. A miss runs the
    /// backend with one transparent retry; concurrent misses for the same
    /// key wait on the first caller and then hit the cache.
    pub async fn get(
        &self,
        text: &str,
        locale: Locale,
    ) -> Result<Arc<AudioArtifact>, BackendError> {
        let voice = self.voice_for(locale).to_owned();
        let key = artifact_key(text, locale, &voice);

        if let Some(hit) = self.lookup(&key) {
            self.metrics.synthesis_cache_hits.inc();
            return Ok(hit);
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = gate.lock().await;

        // Whoever held the gate before us may have filled the cache.
        if let Some(hit) = self.lookup(&key) {
            self.metrics.synthesis_cache_hits.inc();
            return Ok(hit);
        }
        self.metrics.synthesis_cache_misses.inc();

        let result = self.synthesize_with_retry(text, &voice, locale).await;
        self.inflight.lock().remove(&key);

        let bytes = result?;
        tracing::debug!(
            key = %&key[..12.min(key.len())],
            locale = %locale,
            bytes = bytes.len(),
            "synthesized audio artifact"
        );
        let artifact = Arc::new(AudioArtifact {
            key: key.clone(),
            bytes,
            content_type: "audio/mpeg",
        });
        self.cache.write().insert(
            key,
            CacheEntry {
                artifact: Arc::clone(&artifact),
                created: Instant::now(),
            },
        );
        Ok(artifact)
    }

    /// Cache-only lookup, used by the artifact playback route.
    pub fn fetch(&self, key: &str) -> Option<Arc<AudioArtifact>> {
        self.lookup(key)
    }

    /// Drop entries past their TTL, keeping anything a live call has
    /// pinned. Returns how many entries were reaped.
    pub fn sweep_expired(&self, pinned: &HashSet<String>) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|key, entry| {
            pinned.contains(key) || entry.created.elapsed() < self.ttl
        });
        let reaped = before - cache.len();
        if reaped > 0 {
            tracing::debug!(reaped, remaining = cache.len(), "reaped audio artifacts");
        }
        reaped
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    fn lookup(&self, key: &str) -> Option<Arc<AudioArtifact>> {
        self.cache.read().get(key).map(|e| Arc::clone(&e.artifact))
    }

    async fn synthesize_with_retry(
        &self,
        text: &str,
        voice: &str,
        locale: Locale,
    ) -> Result<Vec<u8>, BackendError> {
        match self.backend.synthesize(text, voice, locale).await {
            Ok(bytes) => Ok(bytes),
            Err(first) => {
                tracing::warn!(error = %first, "synthesis failed, retrying once");
                self.backend.synthesize(text, voice, locale).await
            }
        }
    }
}

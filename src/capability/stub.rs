//! Deterministic in-process capabilities for tests and offline runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{cosine, Completion, Embedder, ExtractedClaim, Extractor};
use crate::error::CapabilityError;
use crate::graph::types::NoteId;
use crate::text;

/// Dimension of [`StubEmbedder`] vectors.
pub const STUB_DIM: usize = 256;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn strip_terminator(s: &str) -> &str {
    s.trim().trim_end_matches(['.', '!', '?']).trim()
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// Splits text into sentences, one claim each, with confidence 1.0 unless
/// overridden. Failures and latency can be scripted.
#[derive(Debug, Default)]
pub struct StubExtractor {
    confidences: Mutex<HashMap<String, f64>>,
    failures: Mutex<VecDeque<CapabilityError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU32,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `confidence` for the sentence `claim` (terminator optional).
    pub fn with_confidence(self, claim: &str, confidence: f64) -> Self {
        lock(&self.confidences).insert(strip_terminator(claim).to_string(), confidence);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_next(&self, times: usize, error: CapabilityError) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(error).take(times));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sentence split on `.`, `!`, `?` and newlines. Speaker tags such as
    /// `[user]` are not claims.
    pub fn split_sentences(input: &str) -> Vec<String> {
        input
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter(|s| !(s.starts_with('[') && s.ends_with(']')))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn extract(&self, input: &str) -> Result<Vec<ExtractedClaim>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        let confidences = lock(&self.confidences);
        Ok(Self::split_sentences(input)
            .into_iter()
            .map(|claim| {
                let confidence = confidences.get(&claim).copied().unwrap_or(1.0);
                ExtractedClaim::new(claim, confidence)
            })
            .collect())
    }
}

// ── Embedder ─────────────────────────────────────────────────────────────────

/// Hashed bag-of-terms vectors over [`text::terms`], L2-normalized, with a
/// brute-force index. Texts with no index terms embed to the zero vector.
#[derive(Debug, Default)]
pub struct StubEmbedder {
    index: Mutex<BTreeMap<NoteId, (Vec<f32>, u32)>>,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    failures: Mutex<VecDeque<CapabilityError>>,
    unavailable: AtomicBool,
    embed_calls: AtomicU32,
    search_calls: AtomicU32,
    search_delay: Mutex<Option<Duration>>,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `vector` for exactly `input` (after trimming a terminator).
    pub fn with_vector(self, input: &str, vector: Vec<f32>) -> Self {
        lock(&self.overrides).insert(strip_terminator(input).to_string(), vector);
        self
    }

    pub fn fail_next(&self, times: usize, error: CapabilityError) {
        lock(&self.failures).extend(std::iter::repeat(error).take(times));
    }

    /// While set, every `embed` call fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn embed_calls(&self) -> u32 {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Sleep this long inside every `nearest` call.
    pub fn set_search_delay(&self, delay: Option<Duration>) {
        *lock(&self.search_delay) = delay;
    }

    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn indexed(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn vector_for(&self, input: &str) -> Vec<f32> {
        if let Some(v) = lock(&self.overrides).get(strip_terminator(input)) {
            return v.clone();
        }
        let mut v = vec![0.0f32; STUB_DIM];
        for term in text::terms(input) {
            v[(fnv1a(term.as_bytes()) % STUB_DIM as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, CapabilityError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable("stub embedder offline".into()));
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        Ok(self.vector_for(input))
    }

    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        layer: Option<u32>,
    ) -> Result<Vec<(NoteId, f32)>, CapabilityError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.search_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let index = lock(&self.index);
        let mut scored: Vec<(NoteId, f32)> = index
            .iter()
            .filter(|(_, (_, l))| layer.map_or(true, |want| *l == want))
            .map(|(id, (v, _))| (id.clone(), cosine(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn index(&self, id: &NoteId, vector: &[f32], layer: u32) -> Result<(), CapabilityError> {
        lock(&self.index).insert(id.clone(), (vector.to_vec(), layer));
        Ok(())
    }
}

// ── Completion ───────────────────────────────────────────────────────────────

/// Returns scripted replies in order, then the default reply. Records prompts.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct StubCompletion {
    inner: Arc<CompletionState>,
}

#[derive(Debug, Default)]
struct CompletionState {
    default_reply: String,
    scripted: Mutex<VecDeque<Result<String, CapabilityError>>>,
    prompts: Mutex<Vec<String>>,
}

impl StubCompletion {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CompletionState {
                default_reply: default_reply.into(),
                ..CompletionState::default()
            }),
        }
    }

    pub fn push_reply(&self, reply: Result<String, CapabilityError>) {
        lock(&self.inner.scripted).push_back(reply);
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.inner.prompts).clone()
    }
}

#[async_trait]
impl Completion for StubCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CapabilityError> {
        lock(&self.inner.prompts).push(prompt.to_string());
        match lock(&self.inner.scripted).pop_front() {
            Some(reply) => reply,
            None => Ok(self.inner.default_reply.clone()),
        }
    }
}

//! Music recognition providers
//!
//! A [`Recognizer`] submits one audio window to one external provider and
//! returns a normalized result or a typed failure. New providers implement
//! the trait; nothing downstream knows provider internals.

pub mod acoustid;
pub mod fanout;
pub mod shazam;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use fanout::{FanoutOutcome, ProviderFanout, ProviderOutcome};

/// A successful provider match, normalized across providers.
#[derive(Debug, Clone)]
pub struct RecognitionMatch {
    pub provider: String,
    pub provider_track_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub artwork_url: Option<String>,
    /// Normalized to [0, 1] per provider.
    pub confidence: f64,
    /// Opaque provider response, persisted for diagnostics.
    pub raw_response: Value,
}

/// Outcome of a recognize call that reached the provider.
#[derive(Debug, Clone)]
pub enum Recognition {
    Match(RecognitionMatch),
    /// The provider answered but found nothing.
    NoMatch { raw: Value },
}

/// Failure classification for recognize calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Input failed WAV validation; the provider was never called.
    InvalidAudio,
    Timeout,
    /// Network or I/O failure on the way to the provider.
    Transport,
    RateLimited,
    /// Non-retryable upstream error.
    ProviderError,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidAudio => "invalid_audio",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ProviderError => "provider_error",
            FailureKind::Internal => "internal",
        }
    }
}

/// Typed recognize failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} failure: {message}", .kind.as_str())]
pub struct RecognizeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RecognizeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Capability implemented by every recognition provider.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Stable provider identifier (used as the `provider` column value).
    fn name(&self) -> &'static str;

    /// Recognize one WAV window within `timeout`.
    async fn recognize(
        &self,
        wav_bytes: &[u8],
        timeout: Duration,
    ) -> Result<Recognition, RecognizeFailure>;
}

/// Scripted recognizer returning pre-configured outcomes in sequence.
///
/// Cycles through its script; used by pipeline tests to drive the
/// confirmation state machine deterministically.
pub struct ScriptedRecognizer {
    name: &'static str,
    script: std::sync::Mutex<ScriptState>,
    /// Optional artificial latency, for capacity tests.
    pub delay: Duration,
}

struct ScriptState {
    outcomes: Vec<Result<Recognition, RecognizeFailure>>,
    calls: usize,
}

impl ScriptedRecognizer {
    pub fn new(
        name: &'static str,
        outcomes: Vec<Result<Recognition, RecognizeFailure>>,
    ) -> Self {
        Self {
            name,
            script: std::sync::Mutex::new(ScriptState { outcomes, calls: 0 }),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Build a match outcome for scripts.
    pub fn hit(provider: &str, track_id: &str, title: &str, confidence: f64) -> Recognition {
        Recognition::Match(RecognitionMatch {
            provider: provider.to_string(),
            provider_track_id: track_id.to_string(),
            title: title.to_string(),
            artist: "Test Artist".to_string(),
            album: None,
            isrc: None,
            artwork_url: None,
            confidence,
            raw_response: serde_json::json!({"scripted": true}),
        })
    }

    /// Build a no-match outcome for scripts.
    pub fn miss() -> Recognition {
        Recognition::NoMatch { raw: serde_json::json!({"matches": []}) }
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn recognize(
        &self,
        _wav_bytes: &[u8],
        _timeout: Duration,
    ) -> Result<Recognition, RecognizeFailure> {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        let mut state = self.script.lock().unwrap();
        let outcome = if state.outcomes.is_empty() {
            Ok(Recognition::NoMatch { raw: Value::Null })
        } else {
            state.outcomes[state.calls % state.outcomes.len()].clone()
        };
        state.calls += 1;
        outcome
    }
}

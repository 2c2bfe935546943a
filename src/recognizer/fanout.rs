//! Parallel provider fan-out with admission control
//!
//! Runs every enabled recognizer against a window in parallel, bounded by a
//! global in-flight cap shared across all streams and a per-provider cap
//! shared across all streams. Acquisition is non-blocking: a provider whose
//! capacity is exhausted at dispatch time is skipped for this window, never
//! queued or retried.
//!
//! Dispatch order rotates across windows so no provider is systematically
//! first in line for the global permits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::recognizer::{FailureKind, Recognition, RecognitionMatch, Recognizer};

/// Per-provider outcome of one window dispatch.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Match(RecognitionMatch),
    NoMatch { raw: serde_json::Value },
    Failed { kind: FailureKind, message: String },
    /// Capacity was exhausted at dispatch time; the provider was not called.
    Skipped,
}

impl ProviderOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ProviderOutcome::Skipped)
    }
}

/// One provider's result for one window, with timing.
#[derive(Debug, Clone)]
pub struct FanoutOutcome {
    pub provider: String,
    pub outcome: ProviderOutcome,
    /// Elapsed recognize time, recorded regardless of outcome.
    pub latency_ms: i64,
    /// Completion wall time.
    pub recognized_at: DateTime<Utc>,
}

/// Shared fan-out over the enabled recognizers.
///
/// One instance is shared by all stream workers so the admission caps hold
/// globally, not per stream.
pub struct ProviderFanout {
    providers: Vec<Arc<dyn Recognizer>>,
    global: Arc<Semaphore>,
    per_provider: HashMap<&'static str, Arc<Semaphore>>,
    timeout: Duration,
    rotation: AtomicUsize,
}

impl ProviderFanout {
    pub fn new(
        providers: Vec<Arc<dyn Recognizer>>,
        global_max_inflight: usize,
        per_provider_max_inflight: usize,
        timeout: Duration,
    ) -> Self {
        let per_provider = providers
            .iter()
            .map(|p| (p.name(), Arc::new(Semaphore::new(per_provider_max_inflight))))
            .collect();
        Self {
            providers,
            global: Arc::new(Semaphore::new(global_max_inflight)),
            per_provider,
            timeout,
            rotation: AtomicUsize::new(0),
        }
    }

    /// Names of the registered providers, in registration order.
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Dispatch one window to all providers in parallel.
    ///
    /// Returns one outcome per provider, in registration order. Cancelling
    /// `cancel` abandons in-flight calls (their permits are released as the
    /// aborted tasks drop them) and yields no outcomes.
    pub async fn recognize_window(
        &self,
        wav_bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Vec<FanoutOutcome> {
        if self.providers.is_empty() {
            return Vec::new();
        }

        let wav: Arc<[u8]> = Arc::from(wav_bytes);
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut slots: Vec<Option<FanoutOutcome>> = vec![None; self.providers.len()];
        let mut handles = Vec::new();

        for i in 0..self.providers.len() {
            let idx = (offset + i) % self.providers.len();
            let recognizer = Arc::clone(&self.providers[idx]);
            let name = recognizer.name();

            let Some(permits) = self.try_admit(name) else {
                // A scheduling decision, not a provider event: log it and
                // move on without a recognition attempt.
                warn!(provider = name, "recognition skipped: capacity exhausted");
                slots[idx] = Some(FanoutOutcome {
                    provider: name.to_string(),
                    outcome: ProviderOutcome::Skipped,
                    latency_ms: 0,
                    recognized_at: Utc::now(),
                });
                continue;
            };

            let wav = Arc::clone(&wav);
            let timeout = self.timeout;
            handles.push((
                idx,
                tokio::spawn(async move {
                    let outcome = run_recognize(recognizer, &wav, timeout).await;
                    drop(permits);
                    outcome
                }),
            ));
        }

        // Kept aside so a cancellation can abort still-running calls; an
        // aborted task drops its permits.
        let abort_handles: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        for (idx, handle) in handles {
            let provider = self.providers[idx].name();
            let outcome = tokio::select! {
                joined = handle => match joined {
                    Ok(outcome) => outcome,
                    Err(e) => FanoutOutcome {
                        provider: provider.to_string(),
                        outcome: ProviderOutcome::Failed {
                            kind: FailureKind::Internal,
                            message: format!("recognize task died: {e}"),
                        },
                        latency_ms: 0,
                        recognized_at: Utc::now(),
                    },
                },
                _ = cancel.cancelled() => {
                    debug!("fan-out cancelled, abandoning in-flight calls");
                    for abort in &abort_handles {
                        abort.abort();
                    }
                    return Vec::new();
                }
            };
            slots[idx] = Some(outcome);
        }

        slots.into_iter().flatten().collect()
    }

    /// Acquire global + provider permits without blocking.
    fn try_admit(&self, provider: &str) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let global = Arc::clone(&self.global).try_acquire_owned().ok()?;
        let per = Arc::clone(self.per_provider.get(provider)?).try_acquire_owned().ok()?;
        Some((global, per))
    }
}

async fn run_recognize(
    recognizer: Arc<dyn Recognizer>,
    wav: &[u8],
    timeout: Duration,
) -> FanoutOutcome {
    let provider = recognizer.name().to_string();
    let started = Instant::now();

    let result = tokio::time::timeout(timeout, recognizer.recognize(wav, timeout)).await;
    let latency_ms = started.elapsed().as_millis() as i64;

    let outcome = match result {
        Ok(Ok(Recognition::Match(m))) => {
            debug!(provider = %provider, track = %m.title, confidence = m.confidence, "match");
            ProviderOutcome::Match(m)
        }
        Ok(Ok(Recognition::NoMatch { raw })) => ProviderOutcome::NoMatch { raw },
        Ok(Err(failure)) => {
            warn!(provider = %provider, kind = failure.kind.as_str(), "recognition failed: {}", failure.message);
            ProviderOutcome::Failed { kind: failure.kind, message: failure.message }
        }
        Err(_) => {
            warn!(provider = %provider, latency_ms, "recognition timed out");
            ProviderOutcome::Failed {
                kind: FailureKind::Timeout,
                message: format!("no result within {timeout:?}"),
            }
        }
    };

    FanoutOutcome { provider, outcome, latency_ms, recognized_at: Utc::now() }
}

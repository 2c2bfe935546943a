//! Per-stream worker
//!
//! Glues one audio source, one window scheduler, the shared provider
//! fan-out, one aggregator, and the store into the pipeline for a single
//! stream. Windows are processed inline (the per-call recognize timeout is
//! well under one hop), so within a stream recognitions land in
//! window-start order and plays in confirmed-at order.
//!
//! Failure policy: source failures restart the decoder with its own
//! backoff; an exhausted restart budget parks the worker in `Failed` for a
//! long cooldown before starting from scratch. Store failures pause
//! ingestion briefly (the ring discards the oldest audio) instead of
//! killing the source.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioSource, AudioWindow, Chunk, WindowScheduler};
use crate::clock::Clock;
use crate::config::StreamConfig;
use crate::db::{NewRecognition, Store};
use crate::error::{Error, Result};
use crate::pipeline::aggregator::TwoHitAggregator;
use crate::recognizer::{ProviderFanout, ProviderOutcome};

/// Bytes requested per source read.
const READ_CHUNK_BYTES: usize = 4096;

/// Cooldown after the restart budget is exhausted.
const FAILED_COOLDOWN: Duration = Duration::from_secs(300);

/// Pause before re-attempting ingestion after a persistent store failure.
const STORE_FAILURE_PAUSE: Duration = Duration::from_secs(5);

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        }
    }
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    pub stream: StreamConfig,
    state: Arc<RwLock<WorkerState>>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap()
    }

    /// Signal the worker to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker task, abandoning it past the deadline.
    pub async fn join(self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.join).await.is_err() {
            warn!(stream = %self.stream.name, "worker did not stop within deadline");
        }
    }
}

/// The per-stream pipeline worker.
pub struct StreamWorker {
    stream: StreamConfig,
    stream_id: i64,
    confirming_provider: String,
    source: AudioSource,
    scheduler: WindowScheduler,
    aggregator: TwoHitAggregator,
    fanout: Arc<ProviderFanout>,
    store: Store,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: Arc<RwLock<WorkerState>>,
}

impl StreamWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: StreamConfig,
        stream_id: i64,
        confirming_provider: String,
        hop_tolerance: u32,
        source: AudioSource,
        scheduler: WindowScheduler,
        fanout: Arc<ProviderFanout>,
        store: Store,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            stream_id,
            confirming_provider,
            source,
            scheduler,
            aggregator: TwoHitAggregator::new(hop_tolerance),
            fanout,
            store,
            clock,
            cancel,
            state: Arc::new(RwLock::new(WorkerState::Starting)),
        }
    }

    /// Spawn the worker onto the runtime and return its handle.
    pub fn spawn(self) -> WorkerHandle {
        let stream = self.stream.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());
        WorkerHandle { stream, state, cancel, join }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap() = state;
        debug!(stream = %self.stream.name, state = state.as_str(), "worker state");
    }

    async fn run(mut self) {
        info!(stream = %self.stream.name, url = %self.stream.url, "worker starting");

        while !self.cancel.is_cancelled() {
            match self.run_ingest().await {
                Ok(()) => break, // cancelled
                Err(e) => {
                    warn!(stream = %self.stream.name, "ingest failed: {e}");
                    self.set_state(WorkerState::Restarting);
                    let cancel = self.cancel.clone();
                    let restarted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        restarted = self.source.restart() => restarted,
                    };
                    match restarted {
                        Ok(()) => self.scheduler.realign(),
                        Err(exhausted) => {
                            error!(stream = %self.stream.name, "{exhausted}; cooling down");
                            self.set_state(WorkerState::Failed);
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = self.clock.sleep(FAILED_COOLDOWN) => {}
                            }
                            // Fresh start: budget reset, dead process reaped.
                            self.source.stop().await;
                            self.source.reset_restart_budget();
                        }
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopping);
        self.source.stop().await;
        self.set_state(WorkerState::Stopped);
        info!(stream = %self.stream.name, "worker stopped");
    }

    /// One ingest session: read chunks, cut windows, process them.
    ///
    /// Returns `Ok(())` only on cancellation; any source failure is an error
    /// so the caller can decide on restart.
    async fn run_ingest(&mut self) -> Result<()> {
        if !self.source.is_running() {
            self.set_state(WorkerState::Starting);
            self.source.start().await?;
            self.scheduler.realign();
        }
        self.set_state(WorkerState::Running);

        let cancel = self.cancel.clone();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = self.source.read_chunk(READ_CHUNK_BYTES) => chunk?,
            };

            let pcm = match chunk {
                Chunk::EndOfStream => {
                    return Err(Error::AudioSource("decoder closed its output".to_string()))
                }
                Chunk::Data(pcm) => pcm,
            };

            self.scheduler.push(&pcm);
            let Some(window) = self.scheduler.poll() else {
                continue;
            };

            if let Err(e) = self.process_window(window).await {
                match e {
                    Error::Database(_) => {
                        // Retries inside the store are already spent; pause
                        // ingestion and let the ring shed the oldest audio.
                        error!(stream = %self.stream.name, "store unavailable, pausing ingest: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = self.clock.sleep(STORE_FAILURE_PAUSE) => {}
                        }
                    }
                    other => return Err(other),
                }
            }
        }
    }

    /// Run one window through fan-out, persistence, and confirmation.
    pub async fn process_window(&mut self, window: AudioWindow) -> Result<()> {
        debug!(
            stream = %self.stream.name,
            window_start = %window.start_utc,
            hop_index = window.hop_index,
            "processing window"
        );

        let outcomes = self.fanout.recognize_window(&window.wav_bytes, &self.cancel).await;

        for fanout_outcome in &outcomes {
            if fanout_outcome.outcome.is_skipped() {
                // Scheduling decision: no recognition row.
                continue;
            }

            let (track_id, confidence, raw, error_message) = match &fanout_outcome.outcome {
                ProviderOutcome::Match(m) => {
                    let track_id = self.store.upsert_track(m).await?;
                    (
                        Some(track_id),
                        Some(m.confidence),
                        serde_json::to_string(&m.raw_response).ok(),
                        None,
                    )
                }
                ProviderOutcome::NoMatch { raw } => {
                    (None, None, serde_json::to_string(raw).ok(), None)
                }
                ProviderOutcome::Failed { kind, message } => {
                    (None, None, None, Some(format!("{}: {message}", kind.as_str())))
                }
                ProviderOutcome::Skipped => unreachable!(),
            };

            self.store
                .insert_recognition(&NewRecognition {
                    stream_id: self.stream_id,
                    provider: &fanout_outcome.provider,
                    window_start_utc: window.start_utc,
                    window_end_utc: window.end_utc,
                    recognized_at_utc: fanout_outcome.recognized_at,
                    track_id,
                    confidence,
                    latency_ms: fanout_outcome.latency_ms,
                    raw_response: raw,
                    error_message,
                })
                .await?;
        }

        // Only the confirming provider feeds the state machine.
        let confirming = outcomes.iter().find(|o| o.provider == self.confirming_provider);
        let confirmed = match confirming.map(|o| &o.outcome) {
            Some(ProviderOutcome::Match(m)) => {
                self.aggregator.observe_match(window.hop_index, window.end_utc, m.clone())
            }
            Some(ProviderOutcome::NoMatch { .. }) | Some(ProviderOutcome::Failed { .. }) => {
                self.aggregator.observe_miss(window.hop_index);
                None
            }
            // Skipped or absent: no provider event to observe.
            _ => None,
        };

        if let Some(play) = confirmed {
            let track_id = self.store.upsert_track(&play.matched).await?;
            let result = self
                .store
                .insert_play_idempotent(self.stream_id, track_id, play.recognized_at, play.confidence)
                .await?;
            if result.inserted {
                info!(
                    stream = %self.stream.name,
                    title = %play.matched.title,
                    artist = %play.matched.artist,
                    confidence = play.confidence,
                    "confirmed play"
                );
            } else {
                debug!(
                    stream = %self.stream.name,
                    title = %play.matched.title,
                    "confirmed play suppressed by dedup bucket"
                );
            }
        }

        Ok(())
    }
}

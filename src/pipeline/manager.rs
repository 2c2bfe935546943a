//! Worker manager
//!
//! Owns the set of stream workers, keyed by stream name. Builds the shared
//! provider fan-out (admission caps hold across all streams), registers
//! stream rows at startup, and applies configuration hot-reloads as a set
//! difference: removed workers stop, added workers start, URL changes
//! restart, untouched workers keep running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::{AudioSource, SchedulerConfig, SourceConfig, WindowScheduler};
use crate::audio::wav::WavSpec;
use crate::clock::Clock;
use crate::config::{Config, StreamConfig};
use crate::db::Store;
use crate::error::Result;
use crate::pipeline::worker::{StreamWorker, WorkerHandle, WorkerState};
use crate::recognizer::acoustid::AcoustIdRecognizer;
use crate::recognizer::shazam::ShazamRecognizer;
use crate::recognizer::{ProviderFanout, Recognizer};

/// Grace period for workers to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Manages all stream workers and their shared resources.
pub struct WorkerManager {
    config: Config,
    store: Store,
    fanout: Arc<ProviderFanout>,
    clock: Arc<dyn Clock>,
    workers: HashMap<String, WorkerHandle>,
    cancel: CancellationToken,
}

impl WorkerManager {
    pub fn new(config: Config, store: Store, clock: Arc<dyn Clock>) -> Self {
        let fanout = Arc::new(build_fanout(&config));
        Self {
            config,
            store,
            fanout,
            clock,
            workers: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register all configured streams and start a worker per enabled one.
    pub async fn start_all(&mut self) -> Result<()> {
        info!(
            providers = ?self.fanout.provider_names(),
            "starting stream workers ({} configured streams)",
            self.config.streams.len()
        );
        for (i, stream) in self.config.streams.iter().enumerate() {
            info!(
                "  {}. {}: {} ({})",
                i + 1,
                stream.name,
                stream.url,
                if stream.enabled { "ENABLED" } else { "DISABLED" }
            );
        }

        // Streams are registered even when disabled; they are never
        // destroyed, only disabled.
        for stream in self.config.streams.clone() {
            self.store.ensure_stream(&stream.name, &stream.url, stream.enabled).await?;
            if stream.enabled {
                self.spawn_worker(stream).await?;
            }
        }

        info!("started {} active stream workers", self.workers.len());
        Ok(())
    }

    async fn spawn_worker(&mut self, stream: StreamConfig) -> Result<()> {
        let stream_id = self
            .store
            .ensure_stream(&stream.name, &stream.url, stream.enabled)
            .await?;

        let source = AudioSource::new(SourceConfig {
            stream_name: stream.name.clone(),
            url: stream.url.clone(),
            transport: self.config.rtsp_transport,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            ffmpeg_path: self.config.ffmpeg_path.clone(),
            open_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(15),
            max_restart_attempts: self.config.max_restart_attempts,
            backoff_base: self.config.restart_backoff,
            backoff_cap: self.config.max_backoff,
        });

        let scheduler = WindowScheduler::new(
            SchedulerConfig {
                window_seconds: self.config.window_seconds,
                hop_seconds: self.config.hop_seconds,
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
            },
            Arc::clone(&self.clock),
        );

        let worker = StreamWorker::new(
            stream.clone(),
            stream_id,
            self.config.confirming_provider.clone(),
            self.config.two_hit_hop_tolerance,
            source,
            scheduler,
            Arc::clone(&self.fanout),
            self.store.clone(),
            Arc::clone(&self.clock),
            self.cancel.child_token(),
        );

        let handle = worker.spawn();
        if let Some(previous) = self.workers.insert(stream.name.clone(), handle) {
            // Never leave two workers on one stream name.
            warn!(stream = %stream.name, "replacing existing worker");
            previous.cancel();
            previous.join(SHUTDOWN_GRACE).await;
        }
        Ok(())
    }

    async fn stop_worker(&mut self, name: &str) {
        if let Some(handle) = self.workers.remove(name) {
            info!(stream = %name, "stopping worker");
            handle.cancel();
            handle.join(SHUTDOWN_GRACE).await;
        }
    }

    /// Apply a new configuration's stream set.
    ///
    /// Workers for removed or disabled streams stop, new enabled streams
    /// start, URL changes restart, everything else keeps running.
    pub async fn reload(&mut self, new_config: Config) -> Result<()> {
        info!("applying configuration reload");

        let old: HashMap<String, StreamConfig> = self
            .config
            .enabled_streams()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let new: HashMap<String, StreamConfig> = new_config
            .enabled_streams()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let removed: Vec<String> = old.keys().filter(|n| !new.contains_key(*n)).cloned().collect();
        let added: Vec<String> = new.keys().filter(|n| !old.contains_key(*n)).cloned().collect();
        let changed: Vec<String> = new
            .iter()
            .filter(|(name, stream)| old.get(*name).is_some_and(|o| o.url != stream.url))
            .map(|(name, _)| name.clone())
            .collect();

        info!(
            removed = removed.len(),
            added = added.len(),
            changed = changed.len(),
            "stream set difference"
        );

        for name in removed.iter().chain(&changed) {
            self.stop_worker(name).await;
        }

        self.config = new_config;
        for stream in self.config.streams.clone() {
            self.store.ensure_stream(&stream.name, &stream.url, stream.enabled).await?;
        }
        for name in added.iter().chain(&changed) {
            let stream = new[name].clone();
            self.spawn_worker(stream).await?;
        }

        Ok(())
    }

    /// Worker states, for status logging.
    pub fn status(&self) -> Vec<(String, WorkerState)> {
        let mut status: Vec<_> =
            self.workers.iter().map(|(name, h)| (name.clone(), h.state())).collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Log one status line per worker.
    pub fn log_status(&self) {
        let status = self.status();
        if status.is_empty() {
            warn!("no active stream workers");
            return;
        }
        info!("stream status ({} active workers):", status.len());
        for (name, state) in status {
            info!("  {}: {}", name, state.as_str());
        }
    }

    /// Cancel every worker and wait up to the grace deadline.
    pub async fn shutdown(mut self) {
        info!("stopping all stream workers");
        self.cancel.cancel();
        for (_, handle) in self.workers.drain() {
            handle.join(SHUTDOWN_GRACE).await;
        }
        info!("all stream workers stopped");
    }
}

/// Build the shared fan-out from the enabled providers.
fn build_fanout(config: &Config) -> ProviderFanout {
    let spec = WavSpec { sample_rate: config.sample_rate, channels: config.channels };
    let mut providers: Vec<Arc<dyn Recognizer>> = vec![Arc::new(ShazamRecognizer::new(
        config.shazam_endpoint.clone(),
        spec,
        config.recognize_timeout,
    ))];

    if config.acoustid_enabled {
        providers.push(Arc::new(AcoustIdRecognizer::new(
            config.acoustid_api_key.clone(),
            config.chromaprint_path.clone(),
            spec,
            config.recognize_timeout,
        )));
    }

    ProviderFanout::new(
        providers,
        config.global_max_inflight_recognitions,
        config.per_provider_max_inflight,
        config.recognize_timeout,
    )
}

//! Hop-aligned window scheduling
//!
//! Buffers the PCM stream from an audio source in a rolling byte ring and
//! cuts fixed-length windows on a hop schedule aligned to Unix-epoch
//! boundaries. Emission is driven by `poll` after each chunk of audio is
//! pushed, so the scheduler itself never blocks the source.
//!
//! Timing contract:
//! - the k-th window starts at `k * hop_seconds` on the epoch grid;
//! - a window late by less than half a hop is still emitted;
//! - a window later than that is skipped and the schedule realigns;
//! - a boundary with insufficient buffered audio defers emission until the
//!   ring catches up.
//!
//! All time arithmetic goes through the injected [`Clock`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::audio::wav::{self, WavSpec};
use crate::clock::Clock;

/// Scheduling parameters for one stream.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub window_seconds: u32,
    pub hop_seconds: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SchedulerConfig {
    fn spec(&self) -> WavSpec {
        WavSpec { sample_rate: self.sample_rate, channels: self.channels }
    }

    fn byte_rate(&self) -> usize {
        self.spec().byte_rate() as usize
    }

    fn window_bytes(&self) -> usize {
        self.window_seconds as usize * self.byte_rate()
    }
}

/// A complete audio window ready for recognition.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    /// Hops since the Unix epoch; consecutive windows differ by the number
    /// of hops between them.
    pub hop_index: i64,
    /// Self-contained WAV byte sequence covering the window.
    pub wav_bytes: Vec<u8>,
}

/// Per-stream window scheduler.
pub struct WindowScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    ring: VecDeque<u8>,
    ring_capacity: usize,
    /// Epoch seconds of the next window boundary.
    next_start: i64,
}

impl WindowScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        // Ring holds window + hop seconds so a deferred window can still be
        // assembled a full hop later.
        let ring_capacity =
            (config.window_seconds + config.hop_seconds) as usize * config.byte_rate();
        let next_start = Self::align(clock.now().timestamp(), &config);
        Self { config, clock, ring: VecDeque::new(), ring_capacity, next_start }
    }

    /// First epoch-aligned boundary whose window has not already elapsed.
    fn align(now: i64, config: &SchedulerConfig) -> i64 {
        let hop = config.hop_seconds as i64;
        let mut boundary = now.div_euclid(hop) * hop;
        if now >= boundary + config.window_seconds as i64 {
            boundary += hop;
        }
        boundary
    }

    /// Drop buffered audio and realign to the clock.
    ///
    /// Called after an audio-source restart: partial window bytes captured
    /// before the failure are not continuous with what follows.
    pub fn realign(&mut self) {
        self.ring.clear();
        self.next_start = Self::align(self.clock.now().timestamp(), &self.config);
        debug!(next_window_start = self.next_start, "scheduler realigned");
    }

    /// Append PCM bytes, discarding the oldest beyond ring capacity.
    pub fn push(&mut self, pcm: &[u8]) {
        self.ring.extend(pcm.iter().copied());
        if self.ring.len() > self.ring_capacity {
            let excess = self.ring.len() - self.ring_capacity;
            self.ring.drain(..excess);
        }
    }

    /// Emit the next window if its boundary has passed and enough audio is
    /// buffered.
    ///
    /// Returns `None` when the window is still accruing, when emission must
    /// wait for the ring to fill, or when a too-late window was skipped.
    pub fn poll(&mut self) -> Option<AudioWindow> {
        let now = self.clock.now().timestamp();
        let window = self.config.window_seconds as i64;
        let hop = self.config.hop_seconds as i64;
        let end = self.next_start + window;

        if now < end {
            return None;
        }

        let late = now - end;
        if late * 2 >= hop {
            // Too late to be meaningful; skip to the next aligned boundary.
            warn!(
                window_start = self.next_start,
                late_seconds = late,
                "window missed, skipping to next hop boundary"
            );
            self.next_start = Self::align(now, &self.config);
            return None;
        }

        let window_bytes = self.config.window_bytes();
        if self.ring.len() < window_bytes {
            // Insufficient samples at the boundary; emission is deferred
            // until enough audio accumulates (the late check above bounds
            // how long we keep trying).
            return None;
        }

        let start_at = self.ring.len() - window_bytes;
        let pcm: Vec<u8> = self.ring.iter().skip(start_at).copied().collect();

        let start_utc = Utc.timestamp_opt(self.next_start, 0).unwrap();
        let end_utc = Utc.timestamp_opt(end, 0).unwrap();
        let hop_index = self.next_start.div_euclid(hop);
        self.next_start += hop;

        Some(AudioWindow {
            start_utc,
            end_utc,
            hop_index,
            wav_bytes: wav::wrap_pcm(&pcm, self.config.spec()),
        })
    }

    /// Seconds of audio currently buffered.
    pub fn buffered_seconds(&self) -> f64 {
        self.ring.len() as f64 / self.config.byte_rate() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use std::time::Duration;

    const CONFIG: SchedulerConfig = SchedulerConfig {
        window_seconds: 2,
        hop_seconds: 10,
        sample_rate: 8000,
        channels: 1,
    };

    const BYTE_RATE: usize = 16_000; // 8000 Hz * 1 ch * 2 bytes

    fn scheduler_at(epoch: i64) -> (WindowScheduler, TestClock) {
        let clock = TestClock::at_epoch(epoch);
        let scheduler = WindowScheduler::new(CONFIG, Arc::new(clock.clone()));
        (scheduler, clock)
    }

    fn seconds_of_pcm(secs: usize) -> Vec<u8> {
        vec![0x11; secs * BYTE_RATE]
    }

    #[test]
    fn test_aligns_to_epoch_grid() {
        // Start mid-hop, past the window portion: first boundary is the
        // next hop.
        let (scheduler, _) = scheduler_at(1_005);
        assert_eq!(scheduler.next_start, 1_010);

        // Start inside the window portion: current boundary still usable.
        let (scheduler, _) = scheduler_at(1_001);
        assert_eq!(scheduler.next_start, 1_000);
    }

    #[test]
    fn test_emits_window_with_exact_bounds() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        scheduler.push(&seconds_of_pcm(2));
        assert!(scheduler.poll().is_none(), "window still accruing");

        clock.advance(Duration::from_secs(2));
        let window = scheduler.poll().expect("window due");
        assert_eq!(window.start_utc.timestamp(), 1_000);
        assert_eq!(window.end_utc.timestamp(), 1_002);
        assert_eq!(window.hop_index, 100);
        assert_eq!(window.wav_bytes.len(), wav::HEADER_LEN + 2 * BYTE_RATE);
    }

    #[test]
    fn test_successive_windows_hop_apart() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        let mut starts = Vec::new();

        for _ in 0..3 {
            // Feed a hop's worth of audio in one-second chunks.
            for _ in 0..10 {
                scheduler.push(&seconds_of_pcm(1));
                clock.advance(Duration::from_secs(1));
                if let Some(w) = scheduler.poll() {
                    starts.push(w.start_utc.timestamp());
                }
            }
        }

        assert_eq!(starts, vec![1_000, 1_010, 1_020]);
        for pair in starts.windows(2) {
            assert_eq!((pair[1] - pair[0]) % CONFIG.hop_seconds as i64, 0);
        }
    }

    #[test]
    fn test_late_window_within_half_hop_still_emitted() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        scheduler.push(&seconds_of_pcm(6));
        // 4 seconds past window end, under half the 10s hop.
        clock.advance(Duration::from_secs(6));
        let window = scheduler.poll().expect("late but valid");
        assert_eq!(window.start_utc.timestamp(), 1_000);
    }

    #[test]
    fn test_window_past_half_hop_is_skipped() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        scheduler.push(&seconds_of_pcm(8));
        // 5 seconds past window end = half the hop: skip.
        clock.advance(Duration::from_secs(7));
        assert!(scheduler.poll().is_none());
        assert_eq!(scheduler.next_start, 1_010);
    }

    #[test]
    fn test_insufficient_audio_defers_emission() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        scheduler.push(&seconds_of_pcm(1));
        clock.advance(Duration::from_secs(2));
        assert!(scheduler.poll().is_none(), "only half a window buffered");

        scheduler.push(&seconds_of_pcm(1));
        let window = scheduler.poll().expect("ring caught up");
        assert_eq!(window.start_utc.timestamp(), 1_000);
    }

    #[test]
    fn test_realign_after_source_restart() {
        // Hop grid at 120s with a 12s window, failure at t0+150, restart at
        // t0+170: the next window must start at t0+240, not at the restart
        // time.
        let config = SchedulerConfig {
            window_seconds: 12,
            hop_seconds: 120,
            sample_rate: 8000,
            channels: 1,
        };
        let clock = TestClock::at_epoch(960_000);
        let mut scheduler = WindowScheduler::new(config, Arc::new(clock.clone()));
        assert_eq!(scheduler.next_start, 960_000);

        scheduler.push(&vec![0u8; 16_000 * 30]);
        clock.advance(Duration::from_secs(170));
        scheduler.realign();

        assert_eq!(scheduler.next_start, 960_240);
        assert_eq!(scheduler.buffered_seconds(), 0.0);
    }

    #[test]
    fn test_ring_discards_oldest_audio() {
        let (mut scheduler, _) = scheduler_at(1_000);
        // Capacity is window + hop = 12 seconds.
        scheduler.push(&seconds_of_pcm(20));
        assert_eq!(scheduler.buffered_seconds(), 12.0);
    }

    #[test]
    fn test_window_contains_most_recent_audio() {
        let (mut scheduler, clock) = scheduler_at(1_000);
        scheduler.push(&vec![0xAA; BYTE_RATE]);
        scheduler.push(&vec![0xBB; 2 * BYTE_RATE]);
        clock.advance(Duration::from_secs(2));

        let window = scheduler.poll().unwrap();
        let pcm = &window.wav_bytes[wav::HEADER_LEN..];
        assert!(pcm.iter().all(|&b| b == 0xBB), "window should hold the latest bytes");
    }
}

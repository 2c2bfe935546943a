//! RTSP audio source
//!
//! Owns an ffmpeg subprocess that pulls one RTSP feed and writes 16-bit PCM
//! WAV to its stdout. The source hands raw PCM chunks to the scheduler (the
//! stream's WAV header is consumed here after every start), restarts the
//! subprocess with capped exponential backoff on transient failures, and
//! guarantees the child is killed on every exit path via `kill_on_drop`.

use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::audio::wav;
use crate::config::RtspTransport;
use crate::error::{Error, Result};

/// Grace period between the polite quit request and the hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Cap on stderr lines logged per process lifetime, to keep a chattering
/// decoder from flooding the log.
const STDERR_LOG_LIMIT: usize = 50;

/// Configuration for one audio source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub stream_name: String,
    pub url: String,
    pub transport: RtspTransport,
    pub sample_rate: u32,
    pub channels: u16,
    pub ffmpeg_path: String,
    /// RTSP session open timeout.
    pub open_timeout: Duration,
    /// Per-read deadline on the decoder's stdout.
    pub read_timeout: Duration,
    pub max_restart_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// One read from the source.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Raw PCM bytes (WAV header already consumed).
    Data(Vec<u8>),
    /// The decoder closed its output.
    EndOfStream,
}

/// ffmpeg-backed audio source for a single stream.
pub struct AudioSource {
    config: SourceConfig,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    restart_count: u32,
    /// Bytes read since start that may still contain the WAV header.
    header_buf: Vec<u8>,
    header_consumed: bool,
}

impl AudioSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            child: None,
            stdout: None,
            restart_count: 0,
            header_buf: Vec::new(),
            header_consumed: false,
        }
    }

    /// Launch the decoder subprocess.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        self.wait_for_backoff().await;

        let args = self.build_args();
        debug!(stream = %self.config.stream_name, ?args, "starting decoder");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::AudioSource(format!(
                    "failed to start {}: {e}",
                    self.config.ffmpeg_path
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::AudioSource("decoder stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let stream = self.config.stream_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut logged = 0usize;
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        continue;
                    }
                    logged += 1;
                    if logged <= STDERR_LOG_LIMIT {
                        warn!(stream = %stream, "decoder stderr: {line}");
                    } else if logged == STDERR_LOG_LIMIT + 1 {
                        warn!(stream = %stream, "decoder stderr muted after {STDERR_LOG_LIMIT} lines");
                    }
                }
            });
        }

        self.child = Some(child);
        self.stdout = Some(stdout);
        self.header_buf.clear();
        self.header_consumed = false;

        info!(
            stream = %self.config.stream_name,
            restart_count = self.restart_count,
            "decoder started"
        );
        Ok(())
    }

    /// Read the next chunk of PCM, up to `max_bytes`.
    ///
    /// The first bytes after a start are inspected for a WAV header, which
    /// is stripped; a missing header is tolerated and the bytes pass
    /// through as PCM.
    pub async fn read_chunk(&mut self, max_bytes: usize) -> Result<Chunk> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::AudioSource("source not started".to_string()))?;

        let mut buf = vec![0u8; max_bytes];
        let read = tokio::time::timeout(self.config.read_timeout, stdout.read(&mut buf))
            .await
            .map_err(|_| {
                Error::AudioSource(format!(
                    "no data within read timeout ({:?})",
                    self.config.read_timeout
                ))
            })?
            .map_err(|e| Error::AudioSource(format!("read failed: {e}")))?;

        if read == 0 {
            return Ok(Chunk::EndOfStream);
        }
        buf.truncate(read);

        if self.header_consumed {
            return Ok(Chunk::Data(buf));
        }
        match self.consume_header(buf) {
            Some(pcm) => Ok(Chunk::Data(pcm)),
            // Header still incomplete; report an empty read rather than
            // blocking for more bytes here.
            None => Ok(Chunk::Data(Vec::new())),
        }
    }

    /// Strip the leading WAV header, buffering until it can be parsed.
    fn consume_header(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        self.header_buf.extend_from_slice(&chunk);

        if self.header_buf.len() >= 4 && &self.header_buf[0..4] != b"RIFF" {
            // Bare PCM from the first byte; downstream repair handles it.
            self.header_consumed = true;
            warn!(stream = %self.config.stream_name, "decoder output missing WAV header");
            return Some(std::mem::take(&mut self.header_buf));
        }

        match wav::parse_header(&self.header_buf) {
            Ok(layout) => {
                self.header_consumed = true;
                let pcm = self.header_buf.split_off(layout.data_offset);
                self.header_buf = Vec::new();
                Some(pcm)
            }
            // Not enough bytes yet to finish the chunk walk.
            Err(_) if self.header_buf.len() < wav::HEADER_LEN + 64 => None,
            Err(e) => {
                // Unparseable prefix; pass everything through and let the
                // recognizer-side validation reject it if it truly is junk.
                warn!(stream = %self.config.stream_name, "WAV header unparseable: {e}");
                self.header_consumed = true;
                Some(std::mem::take(&mut self.header_buf))
            }
        }
    }

    /// Gracefully terminate the decoder: polite quit, then hard kill.
    pub async fn stop(&mut self) {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        // ffmpeg exits cleanly on a 'q' on stdin.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.shutdown().await;
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => {
                debug!(stream = %self.config.stream_name, "decoder exited cleanly");
            }
            Err(_) => {
                warn!(stream = %self.config.stream_name, "decoder did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    /// Stop and relaunch with incremented backoff.
    ///
    /// Returns `RestartsExhausted` once the attempt budget is spent; the
    /// caller decides whether to cool down and start from scratch.
    pub async fn restart(&mut self) -> Result<()> {
        if self.restart_count >= self.config.max_restart_attempts {
            return Err(Error::RestartsExhausted {
                stream: self.config.stream_name.clone(),
                attempts: self.restart_count,
            });
        }
        self.restart_count += 1;
        warn!(
            stream = %self.config.stream_name,
            restart_count = self.restart_count,
            "restarting decoder"
        );
        self.stop().await;
        self.start().await
    }

    /// Reset the restart budget after a long cooldown.
    pub fn reset_restart_budget(&mut self) {
        self.restart_count = 0;
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn build_args(&self) -> Vec<String> {
        let open_us = self.config.open_timeout.as_micros().to_string();
        let read_us = self.config.read_timeout.as_micros().to_string();
        vec![
            "-rtsp_transport".to_string(),
            self.config.transport.as_str().to_string(),
            "-stimeout".to_string(),
            open_us,
            "-rw_timeout".to_string(),
            read_us,
            "-i".to_string(),
            self.config.url.clone(),
            "-vn".to_string(),
            "-ac".to_string(),
            self.config.channels.to_string(),
            "-ar".to_string(),
            self.config.sample_rate.to_string(),
            "-f".to_string(),
            "wav".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "pipe:1".to_string(),
        ]
    }

    fn backoff_delay(&self) -> Duration {
        if self.restart_count == 0 {
            return Duration::ZERO;
        }
        let exp = self.config.backoff_base.as_secs_f64()
            * 2f64.powi(self.restart_count.saturating_sub(1) as i32);
        let capped = exp.min(self.config.backoff_cap.as_secs_f64());
        // Jitter spreads simultaneous restarts of multiple streams apart.
        let jitter = rand::rng().random_range(0.0..capped * 0.1 + 0.001);
        Duration::from_secs_f64(capped + jitter)
    }

    async fn wait_for_backoff(&self) {
        let delay = self.backoff_delay();
        if delay > Duration::ZERO {
            warn!(
                stream = %self.config.stream_name,
                restart_count = self.restart_count,
                backoff_seconds = delay.as_secs_f64(),
                "decoder restart backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SourceConfig {
        SourceConfig {
            stream_name: "test".to_string(),
            url: "rtsp://example/audio".to_string(),
            transport: RtspTransport::Tcp,
            sample_rate: 44_100,
            channels: 1,
            ffmpeg_path: "ffmpeg".to_string(),
            open_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(15),
            max_restart_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_decoder_args() {
        let source = AudioSource::new(test_config());
        let args = source.build_args();
        assert_eq!(args[0], "-rtsp_transport");
        assert_eq!(args[1], "tcp");
        assert_eq!(args[2], "-stimeout");
        assert_eq!(args[3], "10000000");
        assert_eq!(args[4], "-rw_timeout");
        assert_eq!(args[5], "15000000");
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.contains(&"wav".to_string()));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut source = AudioSource::new(test_config());
        assert_eq!(source.backoff_delay(), Duration::ZERO);

        source.restart_count = 1;
        let d1 = source.backoff_delay();
        assert!(d1 >= Duration::from_secs(1));

        source.restart_count = 3;
        let d3 = source.backoff_delay();
        assert!(d3 >= Duration::from_secs(4));

        source.restart_count = 30;
        let capped = source.backoff_delay();
        // Cap plus at most 10% jitter.
        assert!(capped <= Duration::from_secs_f64(66.1));
    }

    #[test]
    fn test_restart_budget() {
        let mut source = AudioSource::new(test_config());
        source.restart_count = 4;
        assert!(source.restart_count >= source.config.max_restart_attempts);
        source.reset_restart_budget();
        assert_eq!(source.restart_count, 0);
    }

    #[test]
    fn test_header_stripped_across_partial_chunks() {
        let mut source = AudioSource::new(test_config());
        let spec = wav::WavSpec { sample_rate: 44_100, channels: 1 };
        let pcm: Vec<u8> = (0..200u16).flat_map(|i| i.to_le_bytes()).collect();
        let wav_bytes = wav::wrap_pcm(&pcm, spec);

        // Header arrives split in two reads.
        assert_eq!(source.consume_header(wav_bytes[..20].to_vec()), None);
        let rest = source.consume_header(wav_bytes[20..].to_vec()).unwrap();
        assert_eq!(rest, pcm);
        assert!(source.header_consumed);
    }

    #[test]
    fn test_bare_pcm_passes_through() {
        let mut source = AudioSource::new(test_config());
        let pcm = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let out = source.consume_header(pcm.clone()).unwrap();
        assert_eq!(out, pcm);
    }
}

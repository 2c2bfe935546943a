//! Configuration management for tunewatch
//!
//! All runtime configuration is environment-driven. Stream slots are read
//! from `STREAM_{i}_NAME` / `STREAM_{i}_URL` / `STREAM_{i}_ENABLED` up to
//! `STREAM_COUNT`; a slot with no URL is skipped.
//!
//! Invalid configuration fails startup with a nonzero exit: every value is
//! validated here, before any worker or database handle is created.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Supported PCM sample rates for recognition input.
pub const SUPPORTED_SAMPLE_RATES: [u32; 6] = [8000, 16000, 22050, 32000, 44100, 48000];

/// Maximum number of stream slots.
pub const MAX_STREAMS: usize = 5;

const DEFAULT_SHAZAM_ENDPOINT: &str = "https://amp.shazam.com/discovery/v5/en/US/iphone/-/tag";

/// Configuration for a single RTSP stream slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    pub enabled: bool,
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Store
    pub db_path: String,

    // Windowing and deduplication
    pub window_seconds: u32,
    pub hop_seconds: u32,
    pub dedup_seconds: u32,

    // Decision policy
    pub two_hit_hop_tolerance: u32,
    pub confirming_provider: String,

    // Admission control
    pub global_max_inflight_recognitions: usize,
    pub per_provider_max_inflight: usize,
    pub recognize_timeout: Duration,

    // Audio format requested from the decoder
    pub sample_rate: u32,
    pub channels: u16,

    // Decoder subprocess
    pub ffmpeg_path: String,
    pub rtsp_transport: RtspTransport,
    pub max_restart_attempts: u32,
    pub restart_backoff: Duration,
    pub max_backoff: Duration,

    // Providers
    pub acoustid_enabled: bool,
    pub acoustid_api_key: String,
    pub chromaprint_path: String,
    pub shazam_endpoint: String,

    // Streams
    pub streams: Vec<StreamConfig>,
}

/// RTSP transport forced on the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from an explicit key/value map.
    ///
    /// Used directly by tests so they do not mutate process-global state.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let window_seconds = parse_ranged(get("WINDOW_SECONDS"), "WINDOW_SECONDS", 12, 1, 300)?;
        let hop_seconds = parse_ranged(get("HOP_SECONDS"), "HOP_SECONDS", 120, 1, 86_400)?;
        if hop_seconds <= window_seconds {
            return Err(Error::Config(format!(
                "HOP_SECONDS ({hop_seconds}) must be greater than WINDOW_SECONDS ({window_seconds})"
            )));
        }

        let decision_policy = get("DECISION_POLICY").unwrap_or_else(|| "two_hit".to_string());
        if decision_policy != "two_hit" {
            return Err(Error::Config(format!(
                "DECISION_POLICY must be 'two_hit', got '{decision_policy}'"
            )));
        }

        let sample_rate = parse_ranged(get("SAMPLE_RATE"), "SAMPLE_RATE", 44_100, 1, u32::MAX)?;
        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(Error::Config(format!(
                "SAMPLE_RATE must be one of {SUPPORTED_SAMPLE_RATES:?}, got {sample_rate}"
            )));
        }

        let channels = parse_ranged(get("CHANNELS"), "CHANNELS", 1u32, 1, 2)? as u16;

        let rtsp_transport = match get("RTSP_TRANSPORT").as_deref().unwrap_or("tcp") {
            "tcp" => RtspTransport::Tcp,
            "udp" => RtspTransport::Udp,
            other => {
                return Err(Error::Config(format!(
                    "RTSP_TRANSPORT must be 'tcp' or 'udp', got '{other}'"
                )))
            }
        };

        let acoustid_enabled = parse_bool(get("ACOUSTID_ENABLED").as_deref().unwrap_or("false"));
        let acoustid_api_key = get("ACOUSTID_API_KEY").unwrap_or_default();
        if acoustid_enabled && acoustid_api_key.is_empty() {
            return Err(Error::Config(
                "ACOUSTID_API_KEY is required when ACOUSTID_ENABLED is set".to_string(),
            ));
        }

        let confirming_provider = get("CONFIRMING_PROVIDER").unwrap_or_else(|| "shazam".to_string());
        let known_providers = if acoustid_enabled {
            vec!["shazam", "acoustid"]
        } else {
            vec!["shazam"]
        };
        if !known_providers.contains(&confirming_provider.as_str()) {
            return Err(Error::Config(format!(
                "CONFIRMING_PROVIDER '{confirming_provider}' is not an enabled provider \
                 (enabled: {known_providers:?})"
            )));
        }

        let restart_backoff_secs =
            parse_float(get("RESTART_BACKOFF_SECONDS"), "RESTART_BACKOFF_SECONDS", 1.0)?;
        let max_backoff_secs = parse_float(get("MAX_BACKOFF_SECONDS"), "MAX_BACKOFF_SECONDS", 60.0)?;
        if max_backoff_secs < restart_backoff_secs {
            return Err(Error::Config(format!(
                "MAX_BACKOFF_SECONDS ({max_backoff_secs}) must be at least \
                 RESTART_BACKOFF_SECONDS ({restart_backoff_secs})"
            )));
        }

        let config = Config {
            db_path: get("DB_PATH").unwrap_or_else(|| "/data/plays.db".to_string()),
            window_seconds,
            hop_seconds,
            dedup_seconds: parse_ranged(get("DEDUP_SECONDS"), "DEDUP_SECONDS", 300, 1, u32::MAX)?,
            two_hit_hop_tolerance: parse_ranged(
                get("TWO_HIT_HOP_TOLERANCE"),
                "TWO_HIT_HOP_TOLERANCE",
                1,
                0,
                10,
            )?,
            confirming_provider,
            global_max_inflight_recognitions: parse_ranged(
                get("GLOBAL_MAX_INFLIGHT_RECOGNITIONS"),
                "GLOBAL_MAX_INFLIGHT_RECOGNITIONS",
                3u32,
                1,
                u32::MAX,
            )? as usize,
            per_provider_max_inflight: parse_ranged(
                get("PER_PROVIDER_MAX_INFLIGHT"),
                "PER_PROVIDER_MAX_INFLIGHT",
                3u32,
                1,
                u32::MAX,
            )? as usize,
            recognize_timeout: Duration::from_secs(parse_ranged(
                get("RECOGNIZE_TIMEOUT_SECONDS"),
                "RECOGNIZE_TIMEOUT_SECONDS",
                30,
                1,
                600,
            )? as u64),
            sample_rate,
            channels,
            ffmpeg_path: get("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            rtsp_transport,
            max_restart_attempts: parse_ranged(
                get("MAX_RESTART_ATTEMPTS"),
                "MAX_RESTART_ATTEMPTS",
                10,
                1,
                1000,
            )?,
            restart_backoff: Duration::from_secs_f64(restart_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            acoustid_enabled,
            acoustid_api_key,
            chromaprint_path: get("CHROMAPRINT_PATH")
                .unwrap_or_else(|| "/usr/bin/fpcalc".to_string()),
            shazam_endpoint: get("SHAZAM_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_SHAZAM_ENDPOINT.to_string()),
            streams: parse_streams(vars)?,
        };

        Ok(config)
    }

    /// Streams with a worker at startup.
    pub fn enabled_streams(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter().filter(|s| s.enabled)
    }

    /// Bytes of PCM per second of audio (16-bit samples).
    pub fn pcm_byte_rate(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }
}

fn parse_streams(vars: &HashMap<String, String>) -> Result<Vec<StreamConfig>> {
    let stream_count = match vars.get("STREAM_COUNT").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => {
            let count: usize = raw
                .parse()
                .map_err(|_| Error::Config(format!("STREAM_COUNT is not a number: '{raw}'")))?;
            if count == 0 || count > MAX_STREAMS {
                return Err(Error::Config(format!(
                    "STREAM_COUNT must be 1-{MAX_STREAMS}, got {count}"
                )));
            }
            count
        }
        None => MAX_STREAMS,
    };

    let mut streams = Vec::new();
    for i in 1..=stream_count {
        let url = match vars.get(&format!("STREAM_{i}_URL")) {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => continue, // empty slot
        };
        if !url.starts_with("rtsp://") && !url.starts_with("rtsps://") {
            return Err(Error::Config(format!(
                "STREAM_{i}_URL must be an rtsp:// or rtsps:// URL, got '{url}'"
            )));
        }

        let name = vars
            .get(&format!("STREAM_{i}_NAME"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("stream_{i}"));
        validate_stream_name(&name)?;

        let enabled = vars
            .get(&format!("STREAM_{i}_ENABLED"))
            .map(|v| parse_bool(v))
            .unwrap_or(true);

        streams.push(StreamConfig { name, url, enabled });
    }

    // Duplicate names would leave two workers racing on one stream identity.
    for (idx, stream) in streams.iter().enumerate() {
        if streams[..idx].iter().any(|s| s.name == stream.name) {
            return Err(Error::Config(format!("duplicate stream name '{}'", stream.name)));
        }
    }

    Ok(streams)
}

fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 50 {
        return Err(Error::Config(format!(
            "stream name must be 1-50 characters, got '{name}'"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(Error::Config(format!(
            "stream name may only contain [A-Za-z0-9_-], got '{name}'"
        )));
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_ranged(
    value: Option<String>,
    key: &str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32> {
    let parsed = match value {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("{key} is not a number: '{raw}'")))?,
        None => default,
    };
    if parsed < min || parsed > max {
        return Err(Error::Config(format!("{key} must be in [{min}, {max}], got {parsed}")));
    }
    Ok(parsed)
}

fn parse_float(value: Option<String>, key: &str, default: f64) -> Result<f64> {
    let parsed = match value {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| Error::Config(format!("{key} is not a number: '{raw}'")))?,
        None => default,
    };
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(Error::Config(format!("{key} must be a positive number, got {parsed}")));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn base_vars() -> HashMap<String, String> {
        vars(&[
            ("STREAM_COUNT", "2"),
            ("STREAM_1_NAME", "lobby"),
            ("STREAM_1_URL", "rtsp://cam1/audio"),
            ("STREAM_2_NAME", "patio"),
            ("STREAM_2_URL", "rtsp://cam2/audio"),
            ("STREAM_2_ENABLED", "false"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert_eq!(config.window_seconds, 12);
        assert_eq!(config.hop_seconds, 120);
        assert_eq!(config.dedup_seconds, 300);
        assert_eq!(config.two_hit_hop_tolerance, 1);
        assert_eq!(config.confirming_provider, "shazam");
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.channels, 1);
        assert_eq!(config.rtsp_transport, RtspTransport::Tcp);
    }

    #[test]
    fn test_stream_slots_parsed() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[0].name, "lobby");
        assert!(config.streams[0].enabled);
        assert!(!config.streams[1].enabled);
        assert_eq!(config.enabled_streams().count(), 1);
    }

    #[test]
    fn test_empty_slot_skipped() {
        let mut v = base_vars();
        v.insert("STREAM_COUNT".to_string(), "3".to_string());
        // no STREAM_3_URL
        let config = Config::from_vars(&v).unwrap();
        assert_eq!(config.streams.len(), 2);
    }

    #[test]
    fn test_rejects_non_rtsp_url() {
        let mut v = base_vars();
        v.insert("STREAM_1_URL".to_string(), "http://cam1/audio".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_rejects_bad_stream_name() {
        let mut v = base_vars();
        v.insert("STREAM_1_NAME".to_string(), "lobby stream!".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_rejects_duplicate_stream_names() {
        let mut v = base_vars();
        v.insert("STREAM_2_NAME".to_string(), "lobby".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_hop_must_exceed_window() {
        let mut v = base_vars();
        v.insert("WINDOW_SECONDS".to_string(), "120".to_string());
        v.insert("HOP_SECONDS".to_string(), "120".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_rejects_unknown_decision_policy() {
        let mut v = base_vars();
        v.insert("DECISION_POLICY".to_string(), "three_hit".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_rejects_unsupported_sample_rate() {
        let mut v = base_vars();
        v.insert("SAMPLE_RATE".to_string(), "11025".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_acoustid_requires_api_key() {
        let mut v = base_vars();
        v.insert("ACOUSTID_ENABLED".to_string(), "true".to_string());
        assert!(Config::from_vars(&v).is_err());

        v.insert("ACOUSTID_API_KEY".to_string(), "abc123".to_string());
        let config = Config::from_vars(&v).unwrap();
        assert!(config.acoustid_enabled);
    }

    #[test]
    fn test_confirming_provider_must_be_enabled() {
        let mut v = base_vars();
        v.insert("CONFIRMING_PROVIDER".to_string(), "acoustid".to_string());
        assert!(Config::from_vars(&v).is_err());

        v.insert("ACOUSTID_ENABLED".to_string(), "true".to_string());
        v.insert("ACOUSTID_API_KEY".to_string(), "abc123".to_string());
        let config = Config::from_vars(&v).unwrap();
        assert_eq!(config.confirming_provider, "acoustid");
    }

    #[test]
    fn test_stream_count_bounds() {
        let mut v = base_vars();
        v.insert("STREAM_COUNT".to_string(), "6".to_string());
        assert!(Config::from_vars(&v).is_err());
        v.insert("STREAM_COUNT".to_string(), "0".to_string());
        assert!(Config::from_vars(&v).is_err());
    }

    #[test]
    fn test_pcm_byte_rate() {
        let mut v = base_vars();
        v.insert("CHANNELS".to_string(), "2".to_string());
        let config = Config::from_vars(&v).unwrap();
        assert_eq!(config.pcm_byte_rate(), 44_100 * 2 * 2);
    }
}

//! AcoustID recognizer
//!
//! Fingerprints the window with the Chromaprint `fpcalc` binary and resolves
//! the fingerprint against the AcoustID lookup API. Diagnostic provider by
//! default; it participates in confirmation only when configured as the
//! confirming provider.
//!
//! # API Reference
//! - Endpoint: https://api.acoustid.org/v2/lookup
//! - Documentation: https://acoustid.org/webservice

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::audio::wav::{self, WavSpec};
use crate::recognizer::{
    FailureKind, Recognition, RecognitionMatch, RecognizeFailure, Recognizer,
};

/// AcoustID API endpoint
const ACOUSTID_API_URL: &str = "https://api.acoustid.org/v2/lookup";

/// Minimum acceptable AcoustID match score
const MIN_SCORE: f64 = 0.6;

/// AcoustID recognizer: fpcalc fingerprint + lookup API.
pub struct AcoustIdRecognizer {
    http_client: Client,
    api_key: String,
    fpcalc_path: String,
    spec: WavSpec,
}

impl AcoustIdRecognizer {
    pub fn new(api_key: String, fpcalc_path: String, spec: WavSpec, timeout: Duration) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(timeout + Duration::from_secs(5))
                .build()
                .expect("failed to create HTTP client"),
            api_key,
            fpcalc_path,
            spec,
        }
    }

    /// Fingerprint WAV bytes with fpcalc.
    ///
    /// fpcalc reads files, not pipes, so the window is staged in a temp
    /// file that is removed when the guard drops.
    async fn fingerprint(
        &self,
        wav_bytes: &[u8],
        timeout: Duration,
    ) -> Result<Fingerprint, RecognizeFailure> {
        let mut tmp = tempfile::Builder::new()
            .suffix(".wav")
            .tempfile()
            .map_err(|e| RecognizeFailure::new(FailureKind::Internal, e.to_string()))?;
        tmp.write_all(wav_bytes)
            .map_err(|e| RecognizeFailure::new(FailureKind::Internal, e.to_string()))?;

        let child = Command::new(&self.fpcalc_path)
            .arg("-json")
            .arg(tmp.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| RecognizeFailure::new(FailureKind::Timeout, "fpcalc timed out"))?
            .map_err(|e| {
                RecognizeFailure::new(FailureKind::Internal, format!("fpcalc failed to run: {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognizeFailure::new(
                FailureKind::InvalidAudio,
                format!("fpcalc exited with {}: {stderr}", output.status),
            ));
        }

        let parsed: Fingerprint = serde_json::from_slice(&output.stdout).map_err(|e| {
            RecognizeFailure::new(FailureKind::Internal, format!("fpcalc output unparseable: {e}"))
        })?;
        if parsed.fingerprint.is_empty() {
            return Err(RecognizeFailure::new(
                FailureKind::InvalidAudio,
                "fpcalc returned no fingerprint",
            ));
        }

        debug!(duration = parsed.duration, "fingerprint generated");
        Ok(parsed)
    }

    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        timeout: Duration,
    ) -> Result<Recognition, RecognizeFailure> {
        let duration = (fingerprint.duration.round() as i64).to_string();
        let response = self
            .http_client
            .post(ACOUSTID_API_URL)
            .form(&[
                ("client", self.api_key.as_str()),
                ("duration", duration.as_str()),
                ("fingerprint", fingerprint.fingerprint.as_str()),
                ("meta", "recordings"),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RecognizeFailure::new(FailureKind::Timeout, "lookup timed out")
                } else {
                    RecognizeFailure::new(FailureKind::Transport, e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RecognizeFailure::new(FailureKind::RateLimited, "HTTP 429"));
        }
        if !status.is_success() {
            return Err(RecognizeFailure::new(
                FailureKind::ProviderError,
                format!("HTTP {status}"),
            ));
        }

        let raw: Value = response.json().await.map_err(|e| {
            RecognizeFailure::new(FailureKind::ProviderError, format!("malformed response: {e}"))
        })?;
        self.parse_lookup(raw)
    }

    fn parse_lookup(&self, raw: Value) -> Result<Recognition, RecognizeFailure> {
        let parsed: LookupResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            RecognizeFailure::new(FailureKind::ProviderError, format!("unexpected shape: {e}"))
        })?;

        if parsed.status != "ok" {
            let message =
                parsed.error.map_or("unknown error".to_string(), |e| e.message);
            return Err(RecognizeFailure::new(FailureKind::ProviderError, message));
        }

        // Highest-scoring result at or above the floor; ties keep provider
        // order.
        let best = parsed
            .results
            .into_iter()
            .filter(|r| r.score >= MIN_SCORE)
            .max_by(|a, b| {
                a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal)
            });

        let Some(result) = best else {
            return Ok(Recognition::NoMatch { raw });
        };
        let Some(recording) = result.recordings.into_iter().flatten().next() else {
            return Ok(Recognition::NoMatch { raw });
        };

        let artist = recording
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Recognition::Match(RecognitionMatch {
            provider: "acoustid".to_string(),
            provider_track_id: recording.id,
            title: recording.title.unwrap_or_default(),
            artist,
            album: None,
            isrc: None,
            artwork_url: None,
            confidence: confidence_from_score(result.score),
            raw_response: raw,
        }))
    }
}

/// Map an AcoustID score into a confidence value.
///
/// Scores of 0.6-1.0 step onto 0.80-0.95; anything lower is filtered out
/// before this point. Monotone non-decreasing in the score.
fn confidence_from_score(score: f64) -> f64 {
    if score >= 0.9 {
        0.95
    } else if score >= 0.8 {
        0.90
    } else if score >= 0.7 {
        0.85
    } else {
        0.80
    }
}

#[async_trait]
impl Recognizer for AcoustIdRecognizer {
    fn name(&self) -> &'static str {
        "acoustid"
    }

    async fn recognize(
        &self,
        wav_bytes: &[u8],
        timeout: Duration,
    ) -> Result<Recognition, RecognizeFailure> {
        let payload = wav::repair(wav_bytes, self.spec)
            .map_err(|e| RecognizeFailure::new(FailureKind::InvalidAudio, e.to_string()))?;

        // Budget is shared between fingerprinting and the API call.
        let fp_budget = timeout / 3;
        let fingerprint = self.fingerprint(&payload, fp_budget).await?;
        self.lookup(&fingerprint, timeout - fp_budget).await
    }
}

#[derive(Debug, Deserialize)]
struct Fingerprint {
    duration: f64,
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: String,
    #[serde(default)]
    results: Vec<LookupResult>,
    error: Option<LookupError>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    score: f64,
    recordings: Option<Vec<LookupRecording>>,
}

#[derive(Debug, Deserialize)]
struct LookupRecording {
    id: String,
    title: Option<String>,
    #[serde(default)]
    artists: Vec<LookupArtist>,
}

#[derive(Debug, Deserialize)]
struct LookupArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LookupError {
    message: String,
}

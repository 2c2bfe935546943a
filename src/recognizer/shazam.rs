//! Shazam-compatible recognizer (default confirming provider)
//!
//! Submits the window WAV to a Shazam-compatible recognition endpoint and
//! parses the response shape that service returns: `track.key` is the
//! provider track id, `subtitle` the artist, the album sits in the SONG
//! section metadata, and match quality is expressed as time/frequency skew
//! rather than an explicit confidence.
//!
//! Confidence is derived from the skew values with stepped penalty
//! multipliers: lower skew means higher confidence, and the mapping is
//! monotone in both inputs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::audio::wav::{self, WavSpec};
use crate::recognizer::{
    FailureKind, Recognition, RecognitionMatch, RecognizeFailure, Recognizer,
};

/// Shazam recognizer over a configurable HTTP endpoint.
pub struct ShazamRecognizer {
    http_client: Client,
    endpoint: String,
    spec: WavSpec,
}

impl ShazamRecognizer {
    pub fn new(endpoint: String, spec: WavSpec, timeout: Duration) -> Self {
        Self {
            http_client: Client::builder()
                // Client-level ceiling; each call also carries its own timeout.
                .timeout(timeout + Duration::from_secs(5))
                .build()
                .expect("failed to create HTTP client"),
            endpoint,
            spec,
        }
    }

    fn parse_response(&self, response: Value) -> Result<Recognition, RecognizeFailure> {
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            return Err(RecognizeFailure::new(FailureKind::ProviderError, message));
        }

        let matches = response.get("matches").and_then(Value::as_array);
        let track = response.get("track");
        let (Some(matches), Some(track)) = (matches, track) else {
            debug!("no match in provider response");
            return Ok(Recognition::NoMatch { raw: response });
        };
        if matches.is_empty() {
            return Ok(Recognition::NoMatch { raw: response });
        }

        let track_id = track.get("key").and_then(Value::as_str).unwrap_or_default();
        if track_id.is_empty() {
            return Ok(Recognition::NoMatch { raw: response });
        }
        let title = track.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
        // The artist rides in `subtitle`.
        let artist = track.get("subtitle").and_then(Value::as_str).unwrap_or_default().to_string();
        let isrc = track.get("isrc").and_then(Value::as_str).map(str::to_string);

        let album = track
            .get("sections")
            .and_then(Value::as_array)
            .and_then(|sections| {
                sections.iter().find(|s| s.get("type").and_then(Value::as_str) == Some("SONG"))
            })
            .and_then(|song| song.get("metadata"))
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|m| m.get("title").and_then(Value::as_str) == Some("Album"))
            })
            .and_then(|m| m.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let artwork_url = track
            .get("images")
            .and_then(|images| images.get("coverart").or_else(|| images.get("background")))
            .and_then(Value::as_str)
            .map(str::to_string);

        // When several matches come back, the provider orders them best
        // first; skew of the first drives the confidence estimate.
        let confidence = confidence_from_skew(&matches[0]);

        Ok(Recognition::Match(RecognitionMatch {
            provider: "shazam".to_string(),
            provider_track_id: track_id.to_string(),
            title,
            artist,
            album,
            isrc,
            artwork_url,
            confidence,
            raw_response: response,
        }))
    }
}

/// Estimate a [0, 1] confidence from match skew.
///
/// The provider reports how far the submitted audio deviates from the
/// reference in time and frequency; near-zero skew is a near-certain match.
fn confidence_from_skew(m: &Value) -> f64 {
    let time_skew = m.get("timeskew").and_then(Value::as_f64).unwrap_or(0.0).abs();
    let freq_skew = m.get("frequencyskew").and_then(Value::as_f64).unwrap_or(0.0).abs();

    let mut confidence: f64 = 1.0;

    if time_skew > 0.001 {
        confidence *= 0.6;
    } else if time_skew > 0.0001 {
        confidence *= 0.8;
    }

    if freq_skew > 0.0001 {
        confidence *= 0.7;
    } else if freq_skew > 0.00001 {
        confidence *= 0.9;
    }

    confidence.clamp(0.0, 1.0)
}

#[async_trait]
impl Recognizer for ShazamRecognizer {
    fn name(&self) -> &'static str {
        "shazam"
    }

    async fn recognize(
        &self,
        wav_bytes: &[u8],
        timeout: Duration,
    ) -> Result<Recognition, RecognizeFailure> {
        let payload = wav::repair(wav_bytes, self.spec)
            .map_err(|e| RecognizeFailure::new(FailureKind::InvalidAudio, e.to_string()))?;

        let response = self
            .http_client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RecognizeFailure::new(
                        FailureKind::Timeout,
                        format!("recognition timed out after {timeout:?}"),
                    )
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

        let body: Value = response.json().await.map_err(|e| {
            RecognizeFailure::new(FailureKind::ProviderError, format!("malformed response: {e}"))
        })?;

        self.parse_response(body)
    }
}

//! Row types for the play log schema

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A configured RTSP stream.
#[derive(Debug, Clone, FromRow)]
pub struct StreamRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
}

/// A canonical recognized track, keyed by (provider, provider_track_id).
#[derive(Debug, Clone, FromRow)]
pub struct TrackRow {
    pub id: i64,
    pub provider: String,
    pub provider_track_id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub artwork_url: Option<String>,
    pub metadata: Option<String>,
}

/// One recognition attempt against one provider for one window.
#[derive(Debug, Clone, FromRow)]
pub struct RecognitionRow {
    pub id: i64,
    pub stream_id: i64,
    pub provider: String,
    pub recognized_at_utc: DateTime<Utc>,
    pub window_start_utc: DateTime<Utc>,
    pub window_end_utc: DateTime<Utc>,
    pub track_id: Option<i64>,
    pub confidence: Option<f64>,
    pub latency_ms: Option<i64>,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
}

/// A confirmed, de-duplicated play.
#[derive(Debug, Clone, FromRow)]
pub struct PlayRow {
    pub id: i64,
    pub track_id: i64,
    pub stream_id: i64,
    pub recognized_at_utc: DateTime<Utc>,
    pub dedup_bucket: i64,
    pub confidence: Option<f64>,
}

/// Play joined with its track and stream, for read-side listings.
#[derive(Debug, Clone, FromRow)]
pub struct PlayListing {
    pub id: i64,
    pub recognized_at_utc: DateTime<Utc>,
    pub confidence: Option<f64>,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    pub stream_name: String,
}

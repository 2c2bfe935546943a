//! Embedded play-log store
//!
//! Single SQLite file shared by all workers. Writes commit before the call
//! returns; WAL mode keeps concurrent readers unblocked. Write operations
//! retry transient lock contention with bounded exponential backoff; a
//! persistently failing store surfaces the error to the caller, which
//! pauses ingestion rather than queueing unbounded work.

pub mod init;
pub mod models;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::{Error, Result};
use crate::recognizer::RecognitionMatch;

pub use init::{init_database, init_in_memory, run_migrations};
pub use models::{PlayListing, PlayRow, RecognitionRow, StreamRow, TrackRow};

/// Attempts per write before giving up (first try + retries).
const WRITE_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Result of an idempotent play insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayInsert {
    /// False when the dedup bucket was already occupied.
    pub inserted: bool,
    pub play_id: i64,
}

/// One recognition attempt, ready for persistence.
#[derive(Debug, Clone)]
pub struct NewRecognition<'a> {
    pub stream_id: i64,
    pub provider: &'a str,
    pub window_start_utc: DateTime<Utc>,
    pub window_end_utc: DateTime<Utc>,
    pub recognized_at_utc: DateTime<Utc>,
    pub track_id: Option<i64>,
    pub confidence: Option<f64>,
    pub latency_ms: i64,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
}

/// Shared handle to the play-log database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    dedup_seconds: u32,
}

impl Store {
    pub fn new(pool: SqlitePool, dedup_seconds: u32) -> Self {
        Self { pool, dedup_seconds }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Dedup bucket for a play timestamp.
    pub fn dedup_bucket(&self, recognized_at: DateTime<Utc>) -> i64 {
        recognized_at.timestamp().div_euclid(self.dedup_seconds as i64)
    }

    /// Upsert a stream by name, returning its id.
    pub async fn ensure_stream(&self, name: &str, url: &str, enabled: bool) -> Result<i64> {
        retry_write("ensure_stream", || async {
            sqlx::query_scalar(
                r#"
                INSERT INTO streams (name, url, enabled)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE
                    SET url = excluded.url,
                        enabled = excluded.enabled,
                        updated_at = CURRENT_TIMESTAMP
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(url)
            .bind(enabled)
            .fetch_one(&self.pool)
            .await
        })
        .await
    }

    /// Insert or update a track keyed by (provider, provider_track_id).
    pub async fn upsert_track(&self, matched: &RecognitionMatch) -> Result<i64> {
        let metadata = serde_json::to_string(&matched.raw_response).ok();
        retry_write("upsert_track", || async {
            sqlx::query_scalar(
                r#"
                INSERT INTO tracks (
                    provider, provider_track_id, title, artist, album,
                    isrc, artwork_url, metadata
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider, provider_track_id) DO UPDATE
                    SET title = excluded.title,
                        artist = excluded.artist,
                        album = excluded.album,
                        isrc = excluded.isrc,
                        artwork_url = excluded.artwork_url,
                        metadata = excluded.metadata,
                        updated_at = CURRENT_TIMESTAMP
                RETURNING id
                "#,
            )
            .bind(&matched.provider)
            .bind(&matched.provider_track_id)
            .bind(&matched.title)
            .bind(&matched.artist)
            .bind(&matched.album)
            .bind(&matched.isrc)
            .bind(&matched.artwork_url)
            .bind(&metadata)
            .fetch_one(&self.pool)
            .await
        })
        .await
    }

    /// Append one recognition attempt.
    pub async fn insert_recognition(&self, rec: &NewRecognition<'_>) -> Result<i64> {
        retry_write("insert_recognition", || async {
            sqlx::query_scalar(
                r#"
                INSERT INTO recognitions (
                    stream_id, provider, recognized_at_utc, window_start_utc,
                    window_end_utc, track_id, confidence, latency_ms,
                    raw_response, error_message
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(rec.stream_id)
            .bind(rec.provider)
            .bind(rec.recognized_at_utc)
            .bind(rec.window_start_utc)
            .bind(rec.window_end_utc)
            .bind(rec.track_id)
            .bind(rec.confidence)
            .bind(rec.latency_ms)
            .bind(&rec.raw_response)
            .bind(&rec.error_message)
            .fetch_one(&self.pool)
            .await
        })
        .await
    }

    /// Insert a confirmed play; a duplicate in the same dedup bucket is a
    /// silent no-op.
    pub async fn insert_play_idempotent(
        &self,
        stream_id: i64,
        track_id: i64,
        recognized_at: DateTime<Utc>,
        confidence: f64,
    ) -> Result<PlayInsert> {
        let bucket = self.dedup_bucket(recognized_at);

        let inserted: Option<i64> = retry_write("insert_play", || async {
            sqlx::query_scalar(
                r#"
                INSERT INTO plays (
                    track_id, stream_id, recognized_at_utc, dedup_bucket, confidence
                ) VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(track_id, stream_id, dedup_bucket) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(track_id)
            .bind(stream_id)
            .bind(recognized_at)
            .bind(bucket)
            .bind(confidence)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        if let Some(play_id) = inserted {
            return Ok(PlayInsert { inserted: true, play_id });
        }

        // Bucket already occupied; report the surviving row.
        let play_id: i64 = sqlx::query_scalar(
            "SELECT id FROM plays WHERE track_id = ? AND stream_id = ? AND dedup_bucket = ?",
        )
        .bind(track_id)
        .bind(stream_id)
        .bind(bucket)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlayInsert { inserted: false, play_id })
    }

    /// Most recent recognitions, newest first.
    pub async fn recent_recognitions(&self, limit: i64) -> Result<Vec<RecognitionRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM recognitions ORDER BY recognized_at_utc DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Plays for one UTC day, optionally filtered by stream name.
    pub async fn plays_on_day(
        &self,
        day: NaiveDate,
        stream_name: Option<&str>,
    ) -> Result<Vec<PlayListing>> {
        let rows = sqlx::query_as(
            r#"
            SELECT p.id, p.recognized_at_utc, p.confidence,
                   t.title, t.artist, t.album, t.artwork_url,
                   s.name AS stream_name
            FROM plays p
            JOIN tracks t ON p.track_id = t.id
            JOIN streams s ON p.stream_id = s.id
            WHERE DATE(p.recognized_at_utc) = ?
              AND (? IS NULL OR s.name = ?)
            ORDER BY p.recognized_at_utc DESC
            "#,
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(stream_name)
        .bind(stream_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Look up a stream row by name.
    pub async fn stream_by_name(&self, name: &str) -> Result<Option<StreamRow>> {
        let row = sqlx::query_as("SELECT id, name, url, enabled FROM streams WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

/// Run a write with bounded exponential backoff on transient lock errors.
async fn retry_write<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < WRITE_ATTEMPTS && is_transient(&e) => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(op = label, attempt, "store write contended, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{Recognition, ScriptedRecognizer};
    use chrono::TimeZone;

    async fn store() -> Store {
        Store::new(init_in_memory().await.unwrap(), 300)
    }

    fn matched(track_id: &str) -> RecognitionMatch {
        match ScriptedRecognizer::hit("shazam", track_id, "Song", 0.9) {
            Recognition::Match(m) => m,
            _ => unreachable!(),
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn recognition(stream_id: i64, track_id: Option<i64>) -> NewRecognition<'static> {
        NewRecognition {
            stream_id,
            provider: "shazam",
            window_start_utc: at(1_000),
            window_end_utc: at(1_012),
            recognized_at_utc: at(1_014),
            track_id,
            confidence: Some(0.9),
            latency_ms: 1_500,
            raw_response: Some("{}".to_string()),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_stream_upserts_by_name() {
        let store = store().await;
        let id1 = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let id2 = store.ensure_stream("lobby", "rtsp://b", false).await.unwrap();
        assert_eq!(id1, id2, "same name keeps the same id");

        let row = store.stream_by_name("lobby").await.unwrap().unwrap();
        assert_eq!(row.url, "rtsp://b");
        assert!(!row.enabled);
    }

    #[tokio::test]
    async fn test_upsert_track_updates_on_conflict() {
        let store = store().await;
        let id1 = store.upsert_track(&matched("T1")).await.unwrap();

        let mut updated = matched("T1");
        updated.title = "Renamed".to_string();
        let id2 = store.upsert_track(&updated).await.unwrap();
        assert_eq!(id1, id2);

        let title: String = sqlx::query_scalar("SELECT title FROM tracks WHERE id = ?")
            .bind(id1)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(title, "Renamed");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tracks").fetch_one(store.pool()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_insert_recognition_with_and_without_track() {
        let store = store().await;
        let stream_id = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let track_id = store.upsert_track(&matched("T1")).await.unwrap();

        store.insert_recognition(&recognition(stream_id, Some(track_id))).await.unwrap();
        let mut miss = recognition(stream_id, None);
        miss.confidence = None;
        miss.error_message = Some("no result within 30s".to_string());
        store.insert_recognition(&miss).await.unwrap();

        let rows = store.recent_recognitions(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.track_id == Some(track_id)));
        assert!(rows.iter().any(|r| r.error_message.is_some()));
    }

    #[tokio::test]
    async fn test_play_dedup_is_idempotent() {
        let store = store().await;
        let stream_id = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let track_id = store.upsert_track(&matched("T1")).await.unwrap();

        let first = store.insert_play_idempotent(stream_id, track_id, at(240), 0.9).await.unwrap();
        assert!(first.inserted);

        // Same bucket (240 and 250 both land in bucket 0 at 300s width).
        let dup = store.insert_play_idempotent(stream_id, track_id, at(250), 0.5).await.unwrap();
        assert!(!dup.inserted);
        assert_eq!(dup.play_id, first.play_id);

        // The surviving row keeps the first writer's confidence.
        let confidence: f64 = sqlx::query_scalar("SELECT confidence FROM plays WHERE id = ?")
            .bind(first.play_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(confidence, 0.9);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM plays").fetch_one(store.pool()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_play_different_buckets_both_insert() {
        let store = store().await;
        let stream_id = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let track_id = store.upsert_track(&matched("T1")).await.unwrap();

        // 240s -> bucket 0, 360s -> bucket 1.
        assert!(store.insert_play_idempotent(stream_id, track_id, at(240), 0.9).await.unwrap().inserted);
        assert!(store.insert_play_idempotent(stream_id, track_id, at(360), 0.9).await.unwrap().inserted);
        // 300s collides with bucket 1.
        assert!(!store.insert_play_idempotent(stream_id, track_id, at(300), 0.9).await.unwrap().inserted);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM plays").fetch_one(store.pool()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_dedup_scoped_per_stream_and_track() {
        let store = store().await;
        let s1 = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let s2 = store.ensure_stream("patio", "rtsp://b", true).await.unwrap();
        let t1 = store.upsert_track(&matched("T1")).await.unwrap();
        let t2 = store.upsert_track(&matched("T2")).await.unwrap();

        assert!(store.insert_play_idempotent(s1, t1, at(100), 0.9).await.unwrap().inserted);
        assert!(store.insert_play_idempotent(s2, t1, at(100), 0.9).await.unwrap().inserted);
        assert!(store.insert_play_idempotent(s1, t2, at(100), 0.9).await.unwrap().inserted);
    }

    #[tokio::test]
    async fn test_plays_on_day_listing() {
        let store = store().await;
        let stream_id = store.ensure_stream("lobby", "rtsp://a", true).await.unwrap();
        let track_id = store.upsert_track(&matched("T1")).await.unwrap();
        let midday = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        store.insert_play_idempotent(stream_id, track_id, midday, 0.9).await.unwrap();

        let day = midday.date_naive();
        let listed = store.plays_on_day(day, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stream_name, "lobby");
        assert_eq!(listed[0].title, "Song");

        assert!(store.plays_on_day(day, Some("patio")).await.unwrap().is_empty());
        assert_eq!(store.plays_on_day(day, Some("lobby")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_bucket_arithmetic() {
        let store = store().await;
        assert_eq!(store.dedup_bucket(at(0)), 0);
        assert_eq!(store.dedup_bucket(at(299)), 0);
        assert_eq!(store.dedup_bucket(at(300)), 1);
        assert_eq!(store.dedup_bucket(at(-1)), -1, "pre-epoch times floor correctly");
    }
}

//! Database initialization and migrations
//!
//! Opens (creating if needed) the SQLite store, applies connection PRAGMAs,
//! and runs the forward-only numbered migrations. A database carrying a
//! version this binary does not know aborts startup rather than guessing at
//! the schema.

use std::collections::HashSet;
use std::path::Path;

use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Error, Result};

/// Forward-only migration scripts, applied in order.
const MIGRATIONS: &[(&str, &str)] = &[("0001_init", MIGRATION_0001_INIT)];

const MIGRATION_0001_INIT: &str = r#"
-- Streams: RTSP stream configuration, upserted from config at startup
CREATE TABLE streams (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- Tracks: canonical recognized music identities
CREATE TABLE tracks (
    id INTEGER PRIMARY KEY,
    provider TEXT NOT NULL,
    provider_track_id TEXT NOT NULL,
    title TEXT NOT NULL,
    artist TEXT NOT NULL,
    album TEXT,
    isrc TEXT,
    artwork_url TEXT,
    metadata JSON,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(provider, provider_track_id)
);

-- Plays: confirmed plays after two-hit confirmation
CREATE TABLE plays (
    id INTEGER PRIMARY KEY,
    track_id INTEGER NOT NULL,
    stream_id INTEGER NOT NULL,
    recognized_at_utc TIMESTAMP NOT NULL,
    dedup_bucket INTEGER NOT NULL,
    confidence REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (track_id) REFERENCES tracks(id) ON DELETE CASCADE,
    FOREIGN KEY (stream_id) REFERENCES streams(id) ON DELETE CASCADE,
    UNIQUE(track_id, stream_id, dedup_bucket)
);

-- Recognitions: every attempt against a provider, for diagnostics
CREATE TABLE recognitions (
    id INTEGER PRIMARY KEY,
    stream_id INTEGER NOT NULL,
    provider TEXT NOT NULL,
    recognized_at_utc TIMESTAMP NOT NULL,
    window_start_utc TIMESTAMP NOT NULL,
    window_end_utc TIMESTAMP NOT NULL,
    track_id INTEGER,
    confidence REAL,
    latency_ms INTEGER,
    raw_response JSON,
    error_message TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (stream_id) REFERENCES streams(id) ON DELETE CASCADE,
    FOREIGN KEY (track_id) REFERENCES tracks(id) ON DELETE SET NULL
);

CREATE INDEX idx_plays_recognized_at ON plays(recognized_at_utc);
CREATE INDEX idx_plays_stream ON plays(stream_id, recognized_at_utc);
CREATE INDEX idx_recognitions_recognized_at ON recognitions(recognized_at_utc);
CREATE INDEX idx_recognitions_stream ON recognitions(stream_id, recognized_at_utc);
CREATE INDEX idx_tracks_provider ON tracks(provider, provider_track_id);
"#;

/// Open the database file and bring the schema up to date.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    apply_pragmas(&pool).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Open an in-memory database (tests).
///
/// Pinned to a single pooled connection: every new connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn init_in_memory() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    apply_pragmas(&pool).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<()> {
    // WAL keeps readers unblocked during worker writes.
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations in version order.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let applied: HashSet<String> = applied.into_iter().collect();

    // A version we do not ship means the file belongs to a newer build.
    let known: HashSet<&str> = MIGRATIONS.iter().map(|(v, _)| *v).collect();
    if let Some(unknown) = applied.iter().find(|v| !known.contains(v.as_str())) {
        return Err(Error::Migration(format!(
            "database schema version '{unknown}' is newer than this binary"
        )));
    }

    for (version, sql) in MIGRATIONS {
        if applied.contains(*version) {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Migration(format!("migration {version} failed: {e}")))?;
        sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Applied migration {version}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_schema() {
        let pool = init_in_memory().await.unwrap();

        for table in ["streams", "tracks", "plays", "recognitions", "schema_migrations"] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "table {table} missing");
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = init_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_unknown_version_aborts() {
        let pool = init_in_memory().await.unwrap();
        sqlx::query("INSERT INTO schema_migrations (version) VALUES ('9999_future')")
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(err.to_string().contains("newer than this binary"));
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let pool = init_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO plays (track_id, stream_id, recognized_at_utc, dedup_bucket)
             VALUES (999, 999, '2026-01-01T00:00:00Z', 1)",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err(), "dangling foreign keys must be rejected");
    }
}

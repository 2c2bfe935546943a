//! Error types for tunewatch
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for tunewatch
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (missing stream URL, invalid counts)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration errors
    #[error("Migration error: {0}")]
    Migration(String),

    /// Audio source (decoder subprocess) errors
    #[error("Audio source error: {0}")]
    AudioSource(String),

    /// Audio source restart budget exhausted
    #[error("Audio source restarts exhausted for {stream}: {attempts} attempts")]
    RestartsExhausted { stream: String, attempts: u32 },

    /// Malformed or unsupported WAV payload
    #[error("Invalid WAV audio: {0}")]
    InvalidWav(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using tunewatch Error
pub type Result<T> = std::result::Result<T, Error>;

//! Audio ingestion: decoder subprocess, WAV handling, window scheduling

pub mod source;
pub mod wav;
pub mod window;

pub use source::{AudioSource, Chunk, SourceConfig};
pub use window::{AudioWindow, SchedulerConfig, WindowScheduler};

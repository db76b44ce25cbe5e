//! # Transcription Results
//!
//! Recognition results as they come off the upstream channel, and the
//! translator that decides which of them the client gets to see.

pub mod translator;

pub use translator::{EventTranslator, InterimPolicy};

use chrono::{DateTime, Utc};

/// One recognition result produced by the upstream channel.
///
/// `text` is empty when the service returned no alternatives; such events are
/// valid and simply produce nothing for the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// Audio channel the result belongs to (0 for mono)
    pub channel_index: u32,
    pub confidence: Option<f32>,
    /// When the relay received the result
    pub timestamp: DateTime<Utc>,
    /// Offset of the recognised audio from stream start, in seconds
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            channel_index: 0,
            confidence: None,
            timestamp: Utc::now(),
            start_secs: 0.0,
            duration_secs: 0.0,
        }
    }
}

//! # Recognition Service Wire Format
//!
//! JSON messages exchanged with the live transcription endpoint, and the
//! query string used to open it.
//!
//! ## Inbound message types:
//! - `Results`: a recognition result (interim or final)
//! - `Metadata`, `SpeechStarted`, `UtteranceEnd`: informational, ignored
//! - `Error`: the service gave up on the stream
//!
//! Anything else with a `type` field is ignored; anything that is not JSON
//! with a `type` field is a protocol error.

use crate::config::UpstreamConfig;
use crate::error::BridgeResult;
use crate::transcription::TranscriptEvent;
use chrono::Utc;
use serde::Deserialize;

/// Sent when no audio has been written for a while.
pub const KEEPALIVE: &str = r#"{"type":"KeepAlive"}"#;

/// Asks the service to flush pending results and close the stream.
pub const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderMessage {
    Results(ResultsPayload),
    Error(ErrorPayload),
    Metadata,
    SpeechStarted,
    UtteranceEnd,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ResultsPayload {
    #[serde(default)]
    channel_index: Vec<u32>,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    is_final: bool,
    channel: ChannelPayload,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    description: Option<String>,
    message: Option<String>,
    variant: Option<String>,
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Transcript(TranscriptEvent),
    /// Valid message with nothing for the session to do
    Ignored(&'static str),
    /// The service reported a fatal error
    ProviderError(String),
}

/// Decode one text frame from the service.
///
/// A `Results` message without alternatives decodes to an event with empty
/// text. Malformed JSON is an `UpstreamProtocol` error.
pub fn decode(text: &str) -> BridgeResult<Decoded> {
    let message: ProviderMessage = serde_json::from_str(text)?;

    let decoded = match message {
        ProviderMessage::Results(results) => {
            let (transcript, confidence) = results
                .channel
                .alternatives
                .into_iter()
                .next()
                .map(|alt| (alt.transcript, alt.confidence))
                .unwrap_or_default();

            Decoded::Transcript(TranscriptEvent {
                text: transcript,
                is_final: results.is_final,
                channel_index: results.channel_index.first().copied().unwrap_or(0),
                confidence,
                timestamp: Utc::now(),
                start_secs: results.start,
                duration_secs: results.duration,
            })
        }
        ProviderMessage::Error(error) => {
            let reason = error
                .description
                .or(error.message)
                .unwrap_or_else(|| "unspecified error".to_string());
            match error.variant {
                Some(variant) => Decoded::ProviderError(format!("{} ({})", reason, variant)),
                None => Decoded::ProviderError(reason),
            }
        }
        ProviderMessage::Metadata => Decoded::Ignored("Metadata"),
        ProviderMessage::SpeechStarted => Decoded::Ignored("SpeechStarted"),
        ProviderMessage::UtteranceEnd => Decoded::Ignored("UtteranceEnd"),
        ProviderMessage::Unknown => Decoded::Ignored("unknown"),
    };

    Ok(decoded)
}

/// Endpoint URL with the stream parameters in the query string.
pub fn listen_url(config: &UpstreamConfig) -> String {
    let mut params = vec![
        format!("model={}", config.model),
        format!("encoding={}", config.encoding),
        format!("sample_rate={}", config.sample_rate),
        format!("channels={}", config.channels),
        format!("language={}", config.language),
        format!("interim_results={}", config.interim_results),
        format!("smart_format={}", config.smart_format),
    ];
    if config.endpointing_ms > 0 {
        params.push(format!("endpointing={}", config.endpointing_ms));
    }
    if config.utterance_end_ms > 0 {
        params.push(format!("utterance_end_ms={}", config.utterance_end_ms));
    }

    let separator = if config.url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", config.url, separator, params.join("&"))
}

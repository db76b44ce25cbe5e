//! Maps upstream transcript events onto client messages.

use crate::channel::ServerMessage;
use crate::transcription::TranscriptEvent;

/// What to do with interim (non-final) results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterimPolicy {
    Drop,
    /// Send as `interim_transcript`, never as `transcript`
    Surface,
}

impl InterimPolicy {
    pub fn from_flag(forward_interim: bool) -> Self {
        if forward_interim {
            InterimPolicy::Surface
        } else {
            InterimPolicy::Drop
        }
    }
}

/// Stateless filter between upstream results and the client.
#[derive(Debug, Clone, Copy)]
pub struct EventTranslator {
    interim: InterimPolicy,
}

impl EventTranslator {
    pub fn new(interim: InterimPolicy) -> Self {
        Self { interim }
    }

    /// Translate one event. `None` means the client gets nothing; that is not
    /// an error (empty results are routine between utterances).
    pub fn translate(&self, event: &TranscriptEvent) -> Option<ServerMessage> {
        let text = event.text.trim();
        if text.is_empty() {
            return None;
        }

        if event.is_final {
            return Some(ServerMessage::Transcript {
                text: text.to_string(),
                is_final: true,
                timestamp: event.timestamp,
                confidence: event.confidence,
            });
        }

        match self.interim {
            InterimPolicy::Drop => None,
            InterimPolicy::Surface => Some(ServerMessage::InterimTranscript {
                text: text.to_string(),
                is_final: false,
                timestamp: event.timestamp,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_result_becomes_transcript() {
        let translator = EventTranslator::new(InterimPolicy::Drop);
        let event = TranscriptEvent::new("hola", true);

        match translator.translate(&event) {
            Some(ServerMessage::Transcript {
                text,
                is_final,
                timestamp,
                ..
            }) => {
                assert_eq!(text, "hola");
                assert!(is_final);
                assert_eq!(timestamp, event.timestamp);
            }
            other => panic!("expected transcript, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let translator = EventTranslator::new(InterimPolicy::Surface);
        assert!(translator.translate(&TranscriptEvent::new("", true)).is_none());
        assert!(translator.translate(&TranscriptEvent::new("   ", true)).is_none());
        assert!(translator.translate(&TranscriptEvent::new("", false)).is_none());
    }

    #[test]
    fn test_interim_dropped_by_default_policy() {
        let translator = EventTranslator::new(InterimPolicy::from_flag(false));
        assert!(translator.translate(&TranscriptEvent::new("ho", false)).is_none());
    }

    #[test]
    fn test_interim_surfaced_as_distinct_message() {
        let translator = EventTranslator::new(InterimPolicy::from_flag(true));
        let message = translator
            .translate(&TranscriptEvent::new("ho", false))
            .unwrap();
        assert_eq!(message.kind(), "interim_transcript");
    }

    #[test]
    fn test_confidence_carried_through() {
        let translator = EventTranslator::new(InterimPolicy::Drop);
        let mut event = TranscriptEvent::new("buenos días", true);
        event.confidence = Some(0.92);
        match translator.translate(&event) {
            Some(ServerMessage::Transcript { confidence, .. }) => {
                assert_eq!(confidence, Some(0.92))
            }
            other => panic!("expected transcript, got {:?}", other),
        }
    }
}

//! # Audio Backlog
//!
//! Holds client audio that arrives before the upstream channel is ready.
//!
//! ## Key Properties:
//! - **FIFO**: frames leave in exactly the order they arrived
//! - **Bounded**: both frame count and total bytes are capped; a slow or failed
//!   handshake cannot grow memory without limit
//! - **Single use**: drained once on the CONNECTING → READY transition and
//!   never written to again

use crate::audio::AudioFrame;
use crate::config::{BacklogConfig, OverflowPolicy};
use crate::error::{BridgeError, BridgeResult};
use std::collections::VecDeque;

/// Result of a successful [`Backlog::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame stored, nothing lost
    Queued,
    /// Room was made by dropping this many frames (oldest first). An incoming
    /// frame larger than the byte bound is itself the dropped frame.
    Evicted(usize),
}

/// Bounded FIFO of [`AudioFrame`]s.
#[derive(Debug)]
pub struct Backlog {
    frames: VecDeque<AudioFrame>,
    bytes: usize,
    max_frames: usize,
    max_bytes: usize,
    overflow: OverflowPolicy,
    drained: bool,
}

impl Backlog {
    pub fn new(config: &BacklogConfig) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            max_frames: config.max_frames,
            max_bytes: config.max_bytes,
            overflow: config.overflow,
            drained: false,
        }
    }

    /// Append a frame, applying the overflow policy if a bound would be exceeded.
    ///
    /// ## Errors:
    /// - `ResourceExhausted` under [`OverflowPolicy::Abort`] when the frame does not fit
    /// - `ChannelSend` if the backlog was already drained
    pub fn push(&mut self, frame: AudioFrame) -> BridgeResult<PushOutcome> {
        if self.drained {
            return Err(BridgeError::ChannelSend(
                "audio backlog already flushed".to_string(),
            ));
        }

        if self.fits(&frame) {
            self.store(frame);
            return Ok(PushOutcome::Queued);
        }

        match self.overflow {
            OverflowPolicy::Abort => Err(BridgeError::ResourceExhausted(format!(
                "audio backlog full ({} frames, {} bytes) while waiting for upstream",
                self.frames.len(),
                self.bytes
            ))),
            OverflowPolicy::DropOldest => {
                if frame.len() > self.max_bytes {
                    return Ok(PushOutcome::Evicted(1));
                }

                let mut evicted = 0;
                while !self.fits(&frame) {
                    match self.frames.pop_front() {
                        Some(old) => {
                            self.bytes -= old.len();
                            evicted += 1;
                        }
                        None => break,
                    }
                }
                self.store(frame);
                Ok(PushOutcome::Evicted(evicted))
            }
        }
    }

    /// Take every buffered frame in arrival order and close the backlog.
    ///
    /// Later calls return nothing.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.drained = true;
        self.bytes = 0;
        self.frames.drain(..).collect()
    }

    /// Drop whatever is buffered (teardown before the upstream became ready).
    /// Returns the number of frames discarded.
    pub fn discard(&mut self) -> usize {
        let count = self.frames.len();
        self.drain();
        count
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes currently buffered.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[cfg(test)]
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    fn fits(&self, frame: &AudioFrame) -> bool {
        self.frames.len() < self.max_frames && self.bytes + frame.len() <= self.max_bytes
    }

    fn store(&mut self, frame: AudioFrame) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Payload;

    fn frame(sequence: u64, size: usize) -> AudioFrame {
        AudioFrame::new(sequence, Payload::from(vec![sequence as u8; size]))
    }

    fn config(max_frames: usize, max_bytes: usize, overflow: OverflowPolicy) -> BacklogConfig {
        BacklogConfig {
            max_frames,
            max_bytes,
            overflow,
        }
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut backlog = Backlog::new(&config(10, 1024, OverflowPolicy::Abort));
        for seq in 0..5 {
            assert_eq!(backlog.push(frame(seq, 4)).unwrap(), PushOutcome::Queued);
        }
        assert_eq!(backlog.bytes(), 20);

        let drained: Vec<u64> = backlog.drain().iter().map(|f| f.sequence).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(backlog.is_empty());
        assert_eq!(backlog.bytes(), 0);
    }

    #[test]
    fn test_drained_backlog_rejects_writes() {
        let mut backlog = Backlog::new(&config(10, 1024, OverflowPolicy::DropOldest));
        backlog.push(frame(0, 4)).unwrap();
        assert_eq!(backlog.drain().len(), 1);

        assert!(backlog.is_drained());
        assert!(backlog.push(frame(1, 4)).is_err());
        assert!(backlog.drain().is_empty());
    }

    #[test]
    fn test_drop_oldest_on_frame_bound() {
        let mut backlog = Backlog::new(&config(3, 1024, OverflowPolicy::DropOldest));
        for seq in 0..3 {
            backlog.push(frame(seq, 4)).unwrap();
        }
        assert_eq!(backlog.push(frame(3, 4)).unwrap(), PushOutcome::Evicted(1));

        let drained: Vec<u64> = backlog.drain().iter().map(|f| f.sequence).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_oldest_on_byte_bound() {
        let mut backlog = Backlog::new(&config(100, 10, OverflowPolicy::DropOldest));
        backlog.push(frame(0, 4)).unwrap();
        backlog.push(frame(1, 4)).unwrap();
        // needs 8 free bytes: both older frames go
        assert_eq!(backlog.push(frame(2, 8)).unwrap(), PushOutcome::Evicted(2));
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.bytes(), 8);
    }

    #[test]
    fn test_oversized_frame_is_dropped_not_stored() {
        let mut backlog = Backlog::new(&config(100, 10, OverflowPolicy::DropOldest));
        backlog.push(frame(0, 4)).unwrap();
        assert_eq!(backlog.push(frame(1, 11)).unwrap(), PushOutcome::Evicted(1));
        let drained: Vec<u64> = backlog.drain().iter().map(|f| f.sequence).collect();
        assert_eq!(drained, vec![0]);
    }

    #[test]
    fn test_abort_policy_errors_without_losing_frames() {
        let mut backlog = Backlog::new(&config(2, 1024, OverflowPolicy::Abort));
        backlog.push(frame(0, 4)).unwrap();
        backlog.push(frame(1, 4)).unwrap();

        let err = backlog.push(frame(2, 4)).unwrap_err();
        assert_eq!(err.code(), "resource_exhausted");
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_discard_reports_count_and_closes() {
        let mut backlog = Backlog::new(&config(10, 1024, OverflowPolicy::Abort));
        backlog.push(frame(0, 4)).unwrap();
        backlog.push(frame(1, 4)).unwrap();
        assert_eq!(backlog.discard(), 2);
        assert!(backlog.is_drained());
    }
}

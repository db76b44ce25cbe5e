//! # Client Liveness
//!
//! Mobile networks and NAT boxes drop idle connections without sending a
//! close, so silence on the socket proves nothing. The bridge probes the client
//! every keepalive interval and counts the probes that go unanswered.

use chrono::{DateTime, Utc};

/// What the bridge should do on a keepalive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Send another probe
    Probe,
    /// Too many consecutive probes went unanswered
    Stale,
}

/// Missed-probe counter for one client connection.
#[derive(Debug)]
pub struct Liveness {
    max_missed: u32,
    missed: u32,
    awaiting_reply: bool,
    stale: bool,
    last_reply: Option<DateTime<Utc>>,
}

impl Liveness {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            missed: 0,
            awaiting_reply: false,
            stale: false,
            last_reply: None,
        }
    }

    /// Advance one interval.
    ///
    /// An interval counts as missed when the previous probe is still
    /// unanswered at the next tick. Once `max_missed` intervals in a row are
    /// missed the connection is stale, and stays stale.
    pub fn on_tick(&mut self) -> ProbeVerdict {
        if self.stale {
            return ProbeVerdict::Stale;
        }

        if self.awaiting_reply {
            self.missed += 1;
        }

        if self.missed >= self.max_missed {
            self.stale = true;
            return ProbeVerdict::Stale;
        }

        self.awaiting_reply = true;
        ProbeVerdict::Probe
    }

    /// The client answered (pong, or a ping of its own).
    pub fn record_reply(&mut self, at: DateTime<Utc>) {
        if self.stale {
            return;
        }
        self.awaiting_reply = false;
        self.missed = 0;
        self.last_reply = Some(at);
    }

    #[cfg(test)]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_reply(&self) -> Option<DateTime<Utc>> {
        self.last_reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_after_three_unanswered_intervals() {
        let mut liveness = Liveness::new(3);
        assert_eq!(liveness.on_tick(), ProbeVerdict::Probe); // first probe
        assert_eq!(liveness.on_tick(), ProbeVerdict::Probe); // missed 1
        assert_eq!(liveness.on_tick(), ProbeVerdict::Probe); // missed 2
        assert!(!liveness.is_stale());
        assert_eq!(liveness.on_tick(), ProbeVerdict::Stale); // missed 3
        assert!(liveness.is_stale());
        assert_eq!(liveness.missed(), 3);
    }

    #[test]
    fn test_reply_resets_the_count() {
        let mut liveness = Liveness::new(3);
        liveness.on_tick();
        liveness.on_tick();
        liveness.on_tick();
        assert_eq!(liveness.missed(), 2);

        let now = Utc::now();
        liveness.record_reply(now);
        assert_eq!(liveness.missed(), 0);
        assert_eq!(liveness.last_reply(), Some(now));

        for _ in 0..3 {
            assert_eq!(liveness.on_tick(), ProbeVerdict::Probe);
        }
        assert!(!liveness.is_stale());
    }

    #[test]
    fn test_answered_probes_never_go_stale() {
        let mut liveness = Liveness::new(1);
        for _ in 0..20 {
            assert_eq!(liveness.on_tick(), ProbeVerdict::Probe);
            liveness.record_reply(Utc::now());
        }
        assert!(!liveness.is_stale());
    }

    #[test]
    fn test_stale_is_terminal() {
        let mut liveness = Liveness::new(1);
        liveness.on_tick();
        assert_eq!(liveness.on_tick(), ProbeVerdict::Stale);
        liveness.record_reply(Utc::now());
        assert!(liveness.is_stale());
        assert_eq!(liveness.on_tick(), ProbeVerdict::Stale);
    }
}

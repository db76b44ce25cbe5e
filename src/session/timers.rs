//! # Session Timers
//!
//! Each session owns two timers: the keepalive ticker and the hard deadline.
//! Both run as tokio tasks that post [`SessionEvent`]s into the session's
//! queue, and both are aborted when the owning [`SessionTimers`] is cancelled
//! or dropped. A timer task can therefore never outlive its session.

use crate::session::SessionEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Handles to a session's keepalive and deadline tasks.
#[derive(Debug)]
pub struct SessionTimers {
    keepalive: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

impl SessionTimers {
    /// Start both timers.
    ///
    /// ## Parameters:
    /// - **keepalive_every**: first tick one full interval from now, then periodic
    /// - **deadline_in**: single `DeadlineReached` after this long
    /// - **events**: the session's event queue
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        keepalive_every: Duration,
        deadline_in: Duration,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let keepalive_events = events.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + keepalive_every, keepalive_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if keepalive_events.send(SessionEvent::KeepaliveTick).is_err() {
                    break;
                }
            }
        });

        let deadline = tokio::spawn(async move {
            time::sleep(deadline_in).await;
            let _ = events.send(SessionEvent::DeadlineReached);
        });

        Self {
            keepalive: Some(keepalive),
            deadline: Some(deadline),
        }
    }

    /// Abort both timers. Safe to call any number of times.
    pub fn cancel(&mut self) {
        let mut cancelled = 0;
        for handle in [self.keepalive.take(), self.deadline.take()].into_iter().flatten() {
            handle.abort();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(cancelled, "session timers cancelled");
        }
    }

    /// True until [`cancel`](Self::cancel) has run.
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.keepalive.is_some() || self.deadline.is_some()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel();
    }
}

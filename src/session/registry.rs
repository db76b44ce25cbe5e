//! # Session Registry
//!
//! The only state shared between sessions: a map from session id to the
//! handle used to reach that session. Sessions are inserted once on accept.
//! Registering hands back a [`SessionLease`]; the bridge and the upstream task
//! each hold a clone, and the entry is removed when the last clone drops, so a
//! session stays listed until both of its channels are gone.
//!
//! ## Thread Safety:
//! All access goes through one `RwLock`. Admission and shutdown both take the
//! write lock, so no session can slip in between the shutdown broadcast and
//! the refusal of new sessions. The live count is also published on a `watch`
//! channel so shutdown can wait for the map to drain without polling.

use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the registry keeps for each live session.
#[derive(Debug)]
struct SessionEntry {
    created_at: DateTime<Utc>,
    peer: String,
    /// The session's own event queue
    events: UnboundedSender<SessionEvent>,
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub peer: String,
    pub created_at: DateTime<Utc>,
    pub age_seconds: i64,
}

/// Lifetime counters, for the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryTotals {
    pub active: usize,
    pub created: u64,
    pub closed: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Inner {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_sessions: usize,
    /// Only written with the `sessions` write lock held
    accepting: AtomicBool,
    live: watch::Sender<usize>,
    created: AtomicU64,
    closed: AtomicU64,
    rejected: AtomicU64,
}

/// Concurrency-safe session map. Cheap to clone; clones share the same map.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                max_sessions,
                accepting: AtomicBool::new(true),
                live,
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Insert a new session and return its lease.
    ///
    /// ## Errors:
    /// - `ShuttingDown` once [`shutdown_all`](Self::shutdown_all) has run
    /// - `CapacityExceeded` when the registry is full
    /// - `ChannelSend` if the id is already registered (ids are never reused)
    pub fn register(
        &self,
        session_id: &str,
        peer: &str,
        events: UnboundedSender<SessionEvent>,
    ) -> BridgeResult<SessionLease> {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }

        if sessions.len() >= self.inner.max_sessions {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BridgeError::CapacityExceeded(self.inner.max_sessions));
        }

        if sessions.contains_key(session_id) {
            return Err(BridgeError::ChannelSend(format!(
                "session id '{}' already registered",
                session_id
            )));
        }

        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                created_at: Utc::now(),
                peer: peer.to_string(),
                events,
            },
        );
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        self.inner.live.send_replace(sessions.len());

        debug!(session_id, active = sessions.len(), "session registered");
        Ok(SessionLease {
            inner: Arc::new(LeaseInner {
                registry: self.clone(),
                session_id: session_id.to_string(),
            }),
        })
    }

    /// Remove a session. Returns false if it was not registered, so a second
    /// removal of the same id changes nothing.
    fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let removed = sessions.remove(session_id).is_some();
        if removed {
            self.inner.closed.fetch_add(1, Ordering::Relaxed);
            self.inner.live.send_replace(sessions.len());
            debug!(session_id, active = sessions.len(), "session deregistered");
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    /// Number of sessions not yet CLOSED.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether new sessions are admitted.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    pub fn totals(&self) -> RegistryTotals {
        RegistryTotals {
            active: self.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Copy of every registered session, oldest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        let mut summaries: Vec<SessionSummary> = self
            .read()
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                peer: entry.peer.clone(),
                created_at: entry.created_at,
                age_seconds: now.signed_duration_since(entry.created_at).num_seconds(),
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Refuse all further sessions, then ask every registered one to tear
    /// down. Returns how many were asked.
    ///
    /// Sessions deregister themselves as they close; use
    /// [`wait_until_empty`](Self::wait_until_empty) to wait for that.
    pub fn shutdown_all(&self) -> usize {
        let sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.accepting.store(false, Ordering::Release);

        let mut notified = 0;
        for (session_id, entry) in sessions.iter() {
            if entry.events.send(SessionEvent::Shutdown).is_ok() {
                notified += 1;
            } else {
                warn!(session_id = %session_id, "session queue closed before shutdown notice");
            }
        }
        info!(notified, "shutdown requested for all sessions");
        notified
    }

    /// Wait until no sessions remain, or `timeout` elapses.
    /// Returns true if the registry drained.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let mut live = self.inner.live.subscribe();
        tokio::time::timeout(timeout, live.wait_for(|count| *count == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a session listed in the registry.
///
/// Clones share one entry; it is removed when the last clone drops.
#[derive(Debug, Clone)]
pub struct SessionLease {
    inner: Arc<LeaseInner>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }
}

#[derive(Debug)]
struct LeaseInner {
    registry: SessionRegistry,
    session_id: String,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn queue() -> UnboundedSender<SessionEvent> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_register_and_release() {
        let registry = SessionRegistry::new(10);
        let a = registry.register("a", "127.0.0.1", queue()).unwrap();
        let _b = registry.register("b", "127.0.0.1", queue()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(a.session_id(), "a");

        drop(a);
        assert!(!registry.contains("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.len(), 1);

        let totals = registry.totals();
        assert_eq!(totals.created, 2);
        assert_eq!(totals.closed, 1);
        assert_eq!(totals.active, 1);
    }

    #[test]
    fn test_entry_lives_until_last_lease_clone() {
        let registry = SessionRegistry::new(10);
        let bridge_side = registry.register("a", "peer", queue()).unwrap();
        let upstream_side = bridge_side.clone();

        drop(bridge_side);
        assert!(registry.contains("a"));

        drop(upstream_side);
        assert!(!registry.contains("a"));
        assert_eq!(registry.totals().closed, 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SessionRegistry::new(10);
        let _a = registry.register("a", "peer", queue()).unwrap();
        assert!(registry.register("a", "peer", queue()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = SessionRegistry::new(1);
        let a = registry.register("a", "peer", queue()).unwrap();
        let err = registry.register("b", "peer", queue()).unwrap_err();
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(registry.totals().rejected, 1);

        drop(a);
        assert!(registry.register("b", "peer", queue()).is_ok());
    }

    #[test]
    fn test_shutdown_all_notifies_each_session() {
        let registry = SessionRegistry::new(10);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _a = registry.register("a", "peer", tx_a).unwrap();
        let _b = registry.register("b", "peer", tx_b).unwrap();

        assert_eq!(registry.shutdown_all(), 2);
        assert!(matches!(rx_a.try_recv(), Ok(SessionEvent::Shutdown)));
        assert!(matches!(rx_b.try_recv(), Ok(SessionEvent::Shutdown)));
    }

    #[test]
    fn test_register_refused_after_shutdown() {
        let registry = SessionRegistry::new(10);
        assert!(registry.is_accepting());
        registry.shutdown_all();

        assert!(!registry.is_accepting());
        let err = registry.register("late", "peer", queue()).unwrap_err();
        assert_eq!(err.code(), "shutting_down");
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_no_session_admitted_without_shutdown_notice() {
        let registry = SessionRegistry::new(usize::MAX);
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut admitted = Vec::new();
                    for n in 0u64.. {
                        let (tx, rx) = mpsc::unbounded_channel();
                        match registry.register(&format!("{}-{}", worker, n), "peer", tx) {
                            Ok(lease) => admitted.push((lease, rx)),
                            Err(err) => {
                                assert_eq!(err.code(), "shutting_down");
                                break;
                            }
                        }
                    }
                    admitted
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        registry.shutdown_all();

        for worker in workers {
            for (_lease, mut rx) in worker.join().unwrap() {
                assert!(matches!(rx.try_recv(), Ok(SessionEvent::Shutdown)));
            }
        }
    }

    #[test]
    fn test_snapshot_lists_sessions() {
        let registry = SessionRegistry::new(10);
        let _a = registry.register("a", "10.0.0.1", queue()).unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, "a");
        assert_eq!(snapshot[0].peer, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_concurrent_register_and_release() {
        let registry = SessionRegistry::new(1000);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for n in 0..50 {
                    let id = format!("{}-{}", worker, n);
                    let lease = registry.register(&id, "peer", queue()).unwrap();
                    if n % 2 == 0 {
                        drop(lease);
                        assert!(!registry.contains(&id));
                    } else {
                        kept.push(lease);
                    }
                    tokio::task::yield_now().await;
                }
                kept
            }));
        }
        let mut kept = Vec::new();
        for handle in handles {
            kept.extend(handle.await.unwrap());
        }

        assert_eq!(registry.len(), 8 * 25);
        let totals = registry.totals();
        assert_eq!(totals.created, 400);
        assert_eq!(totals.closed, 200);
        assert_eq!(totals.created - totals.closed, registry.len() as u64);

        drop(kept);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_empty() {
        let registry = SessionRegistry::new(10);
        assert!(registry.wait_until_empty(Duration::from_millis(10)).await);

        let lease = registry.register("a", "peer", queue()).unwrap();
        assert!(!registry.wait_until_empty(Duration::from_secs(1)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(lease);
        });
        assert!(registry.wait_until_empty(Duration::from_secs(5)).await);
    }
}

//! # Session Bridge
//!
//! The per-session state machine. A `Bridge` owns both ends of one session
//! (the client connection and the upstream recognition connection) and
//! consumes that session's [`SessionEvent`]s one at a time.
//!
//! ## Key Rust Concepts Used:
//! - **Generics over traits**: the bridge only knows [`ClientChannel`] and
//!   [`UpstreamChannel`], so tests drive it with in-memory fakes
//! - **Ownership**: the channels, backlog and timers are owned fields; nothing
//!   about a session is reachable from outside except through its event queue
//! - **Drop**: a bridge dropped before reaching CLOSED still runs teardown
//!
//! ## Teardown Contract:
//! Every exit path goes through [`Bridge::teardown`], which runs once:
//! cancel timers, discard the backlog, tell the client why, close the client,
//! finish the upstream, release the registry lease. Later close signals are
//! no-ops. The upstream task holds its own clone of the lease, so the registry
//! entry outlives the bridge until that socket is closed as well.

use crate::audio::{AudioFrame, Backlog, Payload, PushOutcome};
use crate::channel::{ClientChannel, ServerMessage, UpstreamChannel};
use crate::config::{BacklogConfig, SessionConfig};
use crate::error::BridgeError;
use crate::session::keepalive::{Liveness, ProbeVerdict};
use crate::session::{SessionEvent, SessionLease, SessionState, SessionTimers, TeardownCause};
use crate::transcription::{EventTranslator, InterimPolicy, TranscriptEvent};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Session behaviour resolved from [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub max_duration: Duration,
    pub keepalive_interval: Duration,
    pub max_missed_pongs: u32,
    pub max_protocol_errors: u32,
    pub interim: InterimPolicy,
    pub backlog: BacklogConfig,
}

impl BridgeSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_duration: config.max_duration(),
            keepalive_interval: config.keepalive_interval(),
            max_missed_pongs: config.max_missed_pongs,
            max_protocol_errors: config.max_protocol_errors,
            interim: InterimPolicy::from_flag(config.forward_interim),
            backlog: config.backlog.clone(),
        }
    }
}

/// Traffic counters for one session, logged at teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_flushed: u64,
    pub frames_forwarded: u64,
    pub frames_evicted: u64,
    pub frames_dropped: u64,
    pub bytes_forwarded: u64,
    pub transcripts_sent: u64,
    pub interims_sent: u64,
    pub protocol_errors: u64,
}

/// One bridged session.
pub struct Bridge<C: ClientChannel, U: UpstreamChannel> {
    id: String,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    state: SessionState,
    client: C,
    upstream: U,
    backlog: Backlog,
    translator: EventTranslator,
    liveness: Liveness,
    timers: Option<SessionTimers>,
    lease: Option<SessionLease>,
    settings: BridgeSettings,
    stats: SessionStats,
    next_sequence: u64,
    /// Consecutive malformed upstream events
    protocol_errors: u32,
}

impl<C: ClientChannel, U: UpstreamChannel> Bridge<C, U> {
    /// Build a bridge for a registered session. The bridge lets go of
    /// `lease` when it reaches CLOSED.
    pub fn new(
        id: impl Into<String>,
        settings: BridgeSettings,
        client: C,
        upstream: U,
        lease: SessionLease,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(settings.max_duration)
            .ok()
            .and_then(|limit| created_at.checked_add_signed(limit))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: id.into(),
            created_at,
            deadline,
            state: SessionState::Connecting,
            client,
            upstream,
            backlog: Backlog::new(&settings.backlog),
            translator: EventTranslator::new(settings.interim),
            liveness: Liveness::new(settings.max_missed_pongs),
            timers: None,
            lease: Some(lease),
            settings,
            stats: SessionStats::default(),
            next_sequence: 0,
            protocol_errors: 0,
        }
    }

    /// Greet the client. Must be the first thing the client receives.
    pub fn start(&mut self) -> SessionState {
        info!(
            session_id = %self.id,
            deadline = %self.deadline,
            "session started, waiting for upstream"
        );
        let greeting = ServerMessage::connected(&self.id);
        if let Err(err) = self.client.send(greeting) {
            self.teardown(TeardownCause::SendFailed(err));
        }
        self.state
    }

    /// Start the keepalive and deadline timers, posting into `events`.
    pub fn attach_timers(&mut self, events: UnboundedSender<SessionEvent>) {
        if self.state.is_terminating() {
            return;
        }
        let elapsed = Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default();
        let remaining = self.settings.max_duration.saturating_sub(elapsed);
        self.timers = Some(SessionTimers::start(
            self.settings.keepalive_interval,
            remaining,
            events,
        ));
    }

    /// Apply one event and return the resulting state.
    pub fn handle(&mut self, event: SessionEvent) -> SessionState {
        if self.state.is_terminating() {
            if let SessionEvent::ClientAudio(payload) = &event {
                self.stats.frames_dropped += 1;
                trace!(session_id = %self.id, bytes = payload.len(), "audio after teardown dropped");
            } else {
                trace!(session_id = %self.id, event = event.label(), "event after teardown ignored");
            }
            return self.state;
        }

        match event {
            SessionEvent::ClientAudio(payload) => self.on_audio(payload),
            SessionEvent::ClientText(text) => self.on_client_text(text),
            SessionEvent::LivenessReply => self.liveness.record_reply(Utc::now()),
            SessionEvent::ClientClosed(reason) => {
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                self.teardown(TeardownCause::ClientClosed(BridgeError::ClientDisconnect(reason)))
            }
            SessionEvent::ClientError(err) => {
                self.teardown(TeardownCause::ClientError(BridgeError::ClientDisconnect(err)))
            }
            SessionEvent::UpstreamOpen => self.on_upstream_open(),
            SessionEvent::UpstreamTranscript(event) => self.on_transcript(event),
            SessionEvent::UpstreamMalformed(err) => self.on_malformed(err),
            SessionEvent::UpstreamFailed(err) => self.teardown(TeardownCause::UpstreamFailed(err)),
            SessionEvent::UpstreamClosed(reason) => {
                self.teardown(TeardownCause::UpstreamClosed(reason))
            }
            SessionEvent::KeepaliveTick => self.on_keepalive_tick(),
            SessionEvent::DeadlineReached => self.teardown(TeardownCause::DeadlineReached),
            SessionEvent::Shutdown => self.teardown(TeardownCause::Shutdown),
        }

        self.state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    #[cfg(test)]
    pub fn last_liveness_reply(&self) -> Option<DateTime<Utc>> {
        self.liveness.last_reply()
    }

    fn on_audio(&mut self, payload: Payload) {
        let frame = AudioFrame::new(self.next_sequence, payload);
        self.next_sequence += 1;
        self.stats.frames_received += 1;

        if self.state.is_forwarding() {
            self.forward(frame);
            return;
        }

        match self.backlog.push(frame) {
            Ok(PushOutcome::Queued) => {}
            Ok(PushOutcome::Evicted(count)) => {
                self.stats.frames_evicted += count as u64;
                warn!(
                    session_id = %self.id,
                    evicted = count,
                    buffered = self.backlog.len(),
                    buffered_bytes = self.backlog.bytes(),
                    "audio backlog full, oldest frames evicted"
                );
            }
            Err(err) => self.teardown(TeardownCause::BacklogOverflow(err)),
        }
    }

    fn forward(&mut self, frame: AudioFrame) {
        let bytes = frame.len() as u64;
        let sequence = frame.sequence;
        match self.upstream.send(frame) {
            Ok(()) => {
                self.stats.frames_forwarded += 1;
                self.stats.bytes_forwarded += bytes;
                self.state = SessionState::Streaming;
                trace!(session_id = %self.id, sequence, bytes, "audio forwarded");
            }
            Err(err) => {
                warn!(session_id = %self.id, sequence, error = %err, "upstream send failed");
                match err {
                    // the stream died before its close event reached us
                    BridgeError::UpstreamConnection(_) => {
                        self.teardown(TeardownCause::UpstreamFailed(err))
                    }
                    _ => self.teardown(TeardownCause::SendFailed(err)),
                }
            }
        }
    }

    fn on_upstream_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(session_id = %self.id, state = %self.state, "duplicate upstream open ignored");
            return;
        }

        self.state = SessionState::Ready;
        let frames = self.backlog.drain();
        let count = frames.len();

        for frame in frames {
            self.forward(frame);
            if self.state.is_terminating() {
                return;
            }
        }

        self.stats.frames_flushed = count as u64;
        self.state = SessionState::Streaming;
        info!(session_id = %self.id, flushed = count, "upstream open, backlog flushed");
    }

    fn on_transcript(&mut self, event: TranscriptEvent) {
        self.protocol_errors = 0;

        let Some(message) = self.translator.translate(&event) else {
            trace!(
                session_id = %self.id,
                is_final = event.is_final,
                "transcript produced no client message"
            );
            return;
        };

        let is_final = event.is_final;
        if let Err(err) = self.client.send(message) {
            self.teardown(TeardownCause::SendFailed(err));
            return;
        }

        if is_final {
            self.stats.transcripts_sent += 1;
            debug!(
                session_id = %self.id,
                channel = event.channel_index,
                start_secs = event.start_secs,
                duration_secs = event.duration_secs,
                "final transcript sent"
            );
        } else {
            self.stats.interims_sent += 1;
        }
    }

    fn on_malformed(&mut self, err: BridgeError) {
        self.protocol_errors += 1;
        self.stats.protocol_errors += 1;
        warn!(
            session_id = %self.id,
            consecutive = self.protocol_errors,
            error = %err,
            "malformed upstream event"
        );

        if err.is_fatal() || self.protocol_errors >= self.settings.max_protocol_errors {
            self.teardown(TeardownCause::ProtocolErrors(err));
            return;
        }

        let notice = ServerMessage::error(err.code(), err.to_string());
        if let Err(send_err) = self.client.send(notice) {
            self.teardown(TeardownCause::SendFailed(send_err));
        }
    }

    fn on_client_text(&mut self, text: String) {
        debug!(session_id = %self.id, len = text.len(), "text frame from client ignored");
        let notice = ServerMessage::error(
            "unsupported_message",
            "Only binary audio frames are accepted",
        );
        if let Err(err) = self.client.send(notice) {
            self.teardown(TeardownCause::SendFailed(err));
        }
    }

    fn on_keepalive_tick(&mut self) {
        match self.liveness.on_tick() {
            ProbeVerdict::Probe => {
                if let Err(err) = self.client.ping() {
                    self.teardown(TeardownCause::SendFailed(err));
                }
            }
            ProbeVerdict::Stale => {
                warn!(
                    session_id = %self.id,
                    missed = self.liveness.missed(),
                    last_reply = ?self.liveness.last_reply(),
                    "client stopped answering keepalives"
                );
                self.teardown(TeardownCause::Stale);
            }
        }
    }

    /// Release everything the session holds. Runs at most once.
    pub fn teardown(&mut self, cause: TeardownCause) {
        if self.state.is_terminating() {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(mut timers) = self.timers.take() {
            timers.cancel();
        }

        let discarded = self.backlog.discard();
        self.stats.frames_dropped += discarded as u64;

        if let Some(notice) = cause.client_notice() {
            if let Err(err) = self.client.send(notice) {
                debug!(session_id = %self.id, error = %err, "could not deliver teardown notice");
            }
        }
        self.client.close(Some(cause.close_notice()));
        self.upstream.finish();
        self.lease.take();

        self.state = SessionState::Closed;

        let stats = self.stats;
        let lifetime_secs = Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds();
        match cause {
            TeardownCause::ClientClosed(_)
            | TeardownCause::DeadlineReached
            | TeardownCause::Shutdown => {
                info!(
                    session_id = %self.id,
                    cause = cause.label(),
                    reason = %cause,
                    lifetime_secs,
                    frames_received = stats.frames_received,
                    frames_forwarded = stats.frames_forwarded,
                    frames_evicted = stats.frames_evicted,
                    frames_dropped = stats.frames_dropped,
                    bytes_forwarded = stats.bytes_forwarded,
                    transcripts = stats.transcripts_sent,
                    interims = stats.interims_sent,
                    "session closed"
                );
            }
            _ => {
                warn!(
                    session_id = %self.id,
                    cause = cause.label(),
                    reason = %cause,
                    lifetime_secs,
                    frames_received = stats.frames_received,
                    frames_forwarded = stats.frames_forwarded,
                    frames_dropped = stats.frames_dropped,
                    protocol_errors = stats.protocol_errors,
                    "session closed abnormally"
                );
            }
        }
    }
}

impl<C: ClientChannel, U: UpstreamChannel> Drop for Bridge<C, U> {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.teardown(TeardownCause::Abandoned);
        }
    }
}

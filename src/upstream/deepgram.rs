//! # Deepgram Live Connection
//!
//! [`DeepgramChannel`] is the bridge's handle on one live transcription
//! stream. The socket itself is owned by a tokio task; the handle only queues
//! audio for it and reads a shared readiness flag, so nothing the bridge calls
//! can block.
//!
//! ## Task Lifecycle:
//! 1. **Connect**: WebSocket handshake with `Authorization: Token <key>`,
//!    bounded by `connect_timeout_ms`
//! 2. **Stream**: write queued audio, post decoded results to the session,
//!    send `KeepAlive` when no audio has been written for a while
//! 3. **Finish**: write whatever audio is still queued, send `CloseStream`,
//!    keep reading for at most `close_grace_ms`, drop the socket
//!
//! Every outcome of the task reaches the session as a [`SessionEvent`]. The
//! task holds a [`SessionLease`], so the session stays registered until the
//! socket is actually gone.

use crate::audio::{AudioFrame, Payload};
use crate::channel::UpstreamChannel;
use crate::config::UpstreamConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::session::{SessionEvent, SessionLease};
use crate::upstream::messages::{self, Decoded, CLOSE_STREAM, KEEPALIVE};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Socket task phase, shared with the handle
const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const GONE: u8 = 2;

/// Build the authenticated handshake request for a stream.
///
/// Also called once at startup so a bad endpoint fails the process instead of
/// every session.
pub fn build_request(config: &UpstreamConfig) -> BridgeResult<Request> {
    let url = messages::listen_url(config);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::Configuration(format!("invalid upstream url: {}", e)))?;

    let token = HeaderValue::from_str(&format!("Token {}", config.api_key))
        .map_err(|e| BridgeError::Configuration(format!("invalid api key: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, token);

    Ok(request)
}

/// Bridge-side handle on one upstream stream.
pub struct DeepgramChannel {
    session_id: String,
    audio: mpsc::Sender<Payload>,
    finish: Option<oneshot::Sender<()>>,
    phase: Arc<AtomicU8>,
}

impl DeepgramChannel {
    /// Start connecting in the background and return immediately.
    ///
    /// `UpstreamOpen` is posted to `events` once the handshake completes;
    /// a failed or timed out handshake posts `UpstreamFailed`.
    pub fn open(
        lease: SessionLease,
        config: &UpstreamConfig,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let session_id = lease.session_id().to_string();
        let (audio_tx, audio_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (finish_tx, finish_rx) = oneshot::channel();
        let phase = Arc::new(AtomicU8::new(CONNECTING));

        let task = StreamTask {
            session_id: session_id.clone(),
            config: config.clone(),
            events,
            phase: phase.clone(),
            _lease: lease,
        };
        tokio::spawn(task.run(audio_rx, finish_rx));

        Self {
            session_id,
            audio: audio_tx,
            finish: Some(finish_tx),
            phase,
        }
    }
}

impl UpstreamChannel for DeepgramChannel {
    fn send(&mut self, frame: AudioFrame) -> BridgeResult<()> {
        if self.finish.is_none() {
            return Err(BridgeError::ChannelSend(
                "upstream stream already finished".to_string(),
            ));
        }
        match self.phase.load(Ordering::Acquire) {
            OPEN => {}
            GONE => {
                return Err(BridgeError::UpstreamConnection(
                    "upstream stream closed".to_string(),
                ))
            }
            _ => {
                return Err(BridgeError::ChannelSend(
                    "upstream stream is not open".to_string(),
                ))
            }
        }

        let sequence = frame.sequence;
        self.audio.try_send(frame.payload).map_err(|err| match err {
            TrySendError::Full(_) => BridgeError::ChannelSend(format!(
                "upstream send queue full at frame {}",
                sequence
            )),
            TrySendError::Closed(_) => {
                BridgeError::UpstreamConnection("upstream stream closed".to_string())
            }
        })
    }

    fn is_ready(&self) -> bool {
        self.finish.is_some() && self.phase.load(Ordering::Acquire) == OPEN
    }

    fn finish(&mut self) {
        if let Some(finish) = self.finish.take() {
            debug!(session_id = %self.session_id, "finishing upstream stream");
            let _ = finish.send(());
        }
    }
}

/// What the reader should do after one inbound frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The task that owns the socket.
struct StreamTask {
    session_id: String,
    config: UpstreamConfig,
    events: UnboundedSender<SessionEvent>,
    phase: Arc<AtomicU8>,
    /// Dropped with the task, after the socket
    _lease: SessionLease,
}

impl StreamTask {
    async fn run(self, mut audio: mpsc::Receiver<Payload>, mut finish: oneshot::Receiver<()>) {
        let request = match build_request(&self.config) {
            Ok(request) => request,
            Err(err) => {
                self.emit(SessionEvent::UpstreamFailed(BridgeError::UpstreamConnection(
                    err.to_string(),
                )));
                return;
            }
        };

        let started = Instant::now();
        let connect = time::timeout(self.config.connect_timeout(), connect_async(request));
        let socket: Socket = tokio::select! {
            result = connect => match result {
                Ok(Ok((socket, response))) => {
                    debug!(
                        session_id = %self.session_id,
                        status = %response.status(),
                        "upstream handshake response"
                    );
                    socket
                }
                Ok(Err(err)) => {
                    warn!(session_id = %self.session_id, error = %err, "upstream handshake failed");
                    self.emit(SessionEvent::UpstreamFailed(BridgeError::UpstreamConnection(
                        format!("handshake failed: {}", err),
                    )));
                    return;
                }
                Err(_) => {
                    warn!(
                        session_id = %self.session_id,
                        timeout_ms = self.config.connect_timeout_ms,
                        "upstream handshake timed out"
                    );
                    self.emit(SessionEvent::UpstreamFailed(BridgeError::UpstreamConnection(
                        format!("handshake timed out after {}ms", self.config.connect_timeout_ms),
                    )));
                    return;
                }
            },
            _ = &mut finish => {
                debug!(session_id = %self.session_id, "session ended before upstream handshake completed");
                return;
            }
        };

        info!(
            session_id = %self.session_id,
            handshake_ms = started.elapsed().as_millis() as u64,
            "upstream stream open"
        );
        let (mut sink, mut source) = socket.split();
        self.phase.store(OPEN, Ordering::Release);
        self.emit(SessionEvent::UpstreamOpen);

        let idle = self.config.keepalive().max(Duration::from_secs(1));
        let mut keepalive = time::interval_at(Instant::now() + idle, idle);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                payload = audio.recv() => match payload {
                    Some(payload) => {
                        let bytes = payload.len();
                        if let Err(err) = sink.send(Message::Binary(payload.to_vec())).await {
                            self.fail(format!("audio write failed: {}", err));
                            return;
                        }
                        trace!(session_id = %self.session_id, bytes, "audio written upstream");
                        keepalive.reset();
                    }
                    None => break,
                },
                _ = &mut finish => break,
                incoming = source.next() => {
                    if self.on_incoming(incoming) == Flow::Stop {
                        return;
                    }
                }
                _ = keepalive.tick() => {
                    trace!(session_id = %self.session_id, "upstream keepalive");
                    if let Err(err) = sink.send(Message::Text(KEEPALIVE.to_string())).await {
                        self.fail(format!("keepalive write failed: {}", err));
                        return;
                    }
                }
            }
        }

        self.phase.store(GONE, Ordering::Release);

        let mut flushed = 0usize;
        while let Ok(payload) = audio.try_recv() {
            if sink.send(Message::Binary(payload.to_vec())).await.is_err() {
                break;
            }
            flushed += 1;
        }
        debug!(session_id = %self.session_id, flushed, "sending CloseStream");

        if sink.send(Message::Text(CLOSE_STREAM.to_string())).await.is_ok() {
            let drain = async {
                while let Some(incoming) = source.next().await {
                    if self.on_incoming(Some(incoming)) == Flow::Stop {
                        break;
                    }
                }
            };
            if time::timeout(self.config.close_grace(), drain).await.is_err() {
                debug!(session_id = %self.session_id, "upstream close grace elapsed");
            }
        }

        let _ = sink.close().await;
        debug!(session_id = %self.session_id, "upstream stream released");
    }

    fn on_incoming(&self, incoming: Option<Result<Message, tungstenite::Error>>) -> Flow {
        let message = match incoming {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                return self.stop(SessionEvent::UpstreamFailed(BridgeError::UpstreamConnection(
                    err.to_string(),
                )));
            }
            None => {
                return self.stop(SessionEvent::UpstreamClosed(
                    "connection dropped without close frame".to_string(),
                ));
            }
        };

        match message {
            Message::Text(text) => match messages::decode(text.as_str()) {
                Ok(Decoded::Transcript(event)) => {
                    self.emit(SessionEvent::UpstreamTranscript(event));
                    Flow::Continue
                }
                Ok(Decoded::Ignored(kind)) => {
                    trace!(session_id = %self.session_id, kind, "upstream message ignored");
                    Flow::Continue
                }
                Ok(Decoded::ProviderError(reason)) => self.stop(SessionEvent::UpstreamFailed(
                    BridgeError::UpstreamConnection(format!("service error: {}", reason)),
                )),
                Err(err) => {
                    self.emit(SessionEvent::UpstreamMalformed(err));
                    Flow::Continue
                }
            },
            Message::Binary(data) => {
                self.emit(SessionEvent::UpstreamMalformed(BridgeError::UpstreamProtocol(
                    format!("unexpected binary frame ({} bytes)", data.len()),
                )));
                Flow::Continue
            }
            Message::Close(frame) => {
                let reason = match frame {
                    Some(frame) => format!("{} {}", frame.code, frame.reason),
                    None => "closed without reason".to_string(),
                };
                self.stop(SessionEvent::UpstreamClosed(reason))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Flow::Continue,
        }
    }

    /// Mark the stream gone before the session hears about it, so a send
    /// racing the event already reports the upstream as closed.
    fn stop(&self, event: SessionEvent) -> Flow {
        self.phase.store(GONE, Ordering::Release);
        self.emit(event);
        Flow::Stop
    }

    fn fail(&self, reason: String) {
        warn!(session_id = %self.session_id, reason = %reason, "upstream stream failed");
        self.stop(SessionEvent::UpstreamFailed(BridgeError::UpstreamConnection(reason)));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!(session_id = %self.session_id, "session gone, upstream event discarded");
        }
    }
}

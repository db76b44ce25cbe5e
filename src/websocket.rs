//! # WebSocket Client Endpoint
//!
//! Accepts client connections on `/listen` (and `/ws`) and turns each one into
//! a bridged session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects, server sends
//!    `{"type":"connection","status":"connected","sessionId":...}`
//! 2. **Audio Streaming**: client sends binary frames of raw audio (format
//!    agreed out of band, 16 kHz linear16 mono by default)
//! 3. **Transcription Results**: server sends `transcript` messages, and
//!    `interim_transcript` messages when enabled
//! 4. **Errors**: server sends `error` messages with a machine-readable code,
//!    then closes if the error ended the session
//! 5. **Liveness**: server pings every keepalive interval; pongs (or client
//!    pings) keep the session alive
//!
//! ## Actor Model:
//! Each connection is one Actix actor ([`ClientSocket`]) that owns the
//! session's [`Bridge`]. WebSocket frames, upstream events and timer ticks are
//! all delivered to the actor, so the bridge only ever runs on one thread at
//! a time.

use crate::channel::{ClientChannel, CloseNotice, ServerMessage};
use crate::error::{BridgeError, BridgeResult};
use crate::session::{Bridge, BridgeSettings, SessionEvent};
use crate::state::AppState;
use crate::upstream::DeepgramChannel;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work the bridge asks the socket actor to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized [`ServerMessage`]
    Text(String),
    Ping,
    Close(CloseNotice),
}

/// The bridge's view of the client socket.
///
/// Writes go through an unbounded queue drained by the owning actor, which
/// keeps [`ClientChannel`] synchronous while the actor context stays private
/// to the actor.
#[derive(Debug)]
pub struct ClientHandle {
    outbound: UnboundedSender<Outbound>,
    closed: bool,
}

impl ClientHandle {
    pub fn new() -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: tx,
                closed: false,
            },
            rx,
        )
    }

    fn push(&self, item: Outbound) -> BridgeResult<()> {
        if self.closed {
            return Err(BridgeError::ChannelSend(
                "client connection closed".to_string(),
            ));
        }
        self.outbound
            .send(item)
            .map_err(|_| BridgeError::ChannelSend("client connection closed".to_string()))
    }
}

impl ClientChannel for ClientHandle {
    fn send(&mut self, message: ServerMessage) -> BridgeResult<()> {
        let json = serde_json::to_string(&message)
            .map_err(|e| BridgeError::ChannelSend(format!("could not encode message: {}", e)))?;
        self.push(Outbound::Text(json))
    }

    fn ping(&mut self) -> BridgeResult<()> {
        self.push(Outbound::Ping)
    }

    fn close(&mut self, notice: Option<CloseNotice>) {
        if self.closed {
            return;
        }
        let notice = notice.unwrap_or_else(|| CloseNotice::new(CloseNotice::NORMAL, ""));
        // the actor may already be gone when the client hung up first
        let _ = self.outbound.send(Outbound::Close(notice));
        self.closed = true;
    }
}

type SessionBridge = Bridge<ClientHandle, DeepgramChannel>;

/// WebSocket actor for one client connection.
pub struct ClientSocket {
    session_id: String,
    bridge: Option<SessionBridge>,
    /// Handed to the session timers on start
    events_tx: Option<UnboundedSender<SessionEvent>>,
    events_rx: Option<UnboundedReceiver<SessionEvent>>,
    outbound_rx: Option<UnboundedReceiver<Outbound>>,
}

impl ClientSocket {
    pub fn new(
        bridge: SessionBridge,
        events_tx: UnboundedSender<SessionEvent>,
        events_rx: UnboundedReceiver<SessionEvent>,
        outbound_rx: UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            session_id: bridge.id().to_string(),
            bridge: Some(bridge),
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            outbound_rx: Some(outbound_rx),
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.handle(event);
        }
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(rx) = self.outbound_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        if let Some(rx) = self.events_rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }

        if let Some(bridge) = self.bridge.as_mut() {
            bridge.start();
            if let Some(events) = self.events_tx.take() {
                bridge.attach_timers(events);
            }
        }
        debug!(session_id = %self.session_id, "client socket started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // usually a no-op: the bridge closed first and the actor is following it
        if let Some(mut bridge) = self.bridge.take() {
            let state =
                bridge.handle(SessionEvent::ClientClosed(Some("socket stopped".to_string())));
            let stats = bridge.stats();
            debug!(
                session_id = %self.session_id,
                state = %state,
                frames_received = stats.frames_received,
                transcripts = stats.transcripts_sent,
                "client socket stopped"
            );
        }
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.dispatch(SessionEvent::ClientAudio(data)),
            Ok(ws::Message::Text(text)) => {
                self.dispatch(SessionEvent::ClientText(text.to_string()))
            }
            Ok(ws::Message::Ping(data)) => {
                // a client ping proves liveness just as well as a pong
                ctx.pong(&data);
                self.dispatch(SessionEvent::LivenessReply);
            }
            Ok(ws::Message::Pong(_)) => self.dispatch(SessionEvent::LivenessReply),
            Ok(ws::Message::Close(reason)) => {
                let reason = reason.map(|r| match r.description {
                    Some(description) => format!("{:?}: {}", r.code, description),
                    None => format!("{:?}", r.code),
                });
                info!(session_id = %self.session_id, reason = ?reason, "client closed connection");
                self.dispatch(SessionEvent::ClientClosed(reason));
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "fragmented frame ignored");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "client protocol error");
                self.dispatch(SessionEvent::ClientError(err.to_string()));
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // TCP went away without a close frame
        self.dispatch(SessionEvent::ClientClosed(None));
        ctx.stop();
    }
}

/// Writes requested by the bridge.
impl StreamHandler<Outbound> for ClientSocket {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Text(json) => ctx.text(json),
            Outbound::Ping => ctx.ping(b""),
            Outbound::Close(notice) => {
                // close frame first, then stop the actor so the socket is released
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::from(notice.code),
                    description: (!notice.reason.is_empty()).then_some(notice.reason),
                }));
                ctx.stop();
            }
        }
    }

    // the bridge owns the sender; ending here means teardown already ran
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Events from the upstream task and session timers.
impl StreamHandler<SessionEvent> for ClientSocket {
    fn handle(&mut self, event: SessionEvent, _ctx: &mut Self::Context) {
        self.dispatch(event);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Admission is decided before the upgrade: a draining server or a full
/// registry answers with 503 and no session is created. Otherwise the session
/// is registered, the upstream connection starts opening in the background,
/// and the request is upgraded.
pub async fn listen(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    // reject plain HTTP before anything is registered or dialled
    ws::handshake(&req)?;

    let session_id = Uuid::new_v4().to_string();
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();

    // One queue per session: socket frames, upstream events and timer ticks
    // all arrive here in order
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let lease = match app_state
        .registry
        .register(&session_id, &peer, events_tx.clone())
    {
        Ok(lease) => lease,
        Err(err) => {
            // capacity or shutdown; answered with 503
            warn!(peer = %peer, error = %err, "session refused");
            return Err(err.into());
        }
    };

    let config = &app_state.config;
    let (client, outbound_rx) = ClientHandle::new();
    // starts dialling now; audio is backlogged until UpstreamOpen
    let upstream = DeepgramChannel::open(lease.clone(), &config.upstream, events_tx.clone());
    let bridge = Bridge::new(
        session_id.clone(),
        BridgeSettings::from_config(&config.session),
        client,
        upstream,
        lease,
    );

    info!(
        session_id = %session_id,
        peer = %peer,
        active = app_state.registry.len(),
        "client connected"
    );

    ws::start(
        ClientSocket::new(bridge, events_tx, events_rx, outbound_rx),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::dev::ServerHandle;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type ClientSocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Recognition service stand-in that accepts every stream and never
    /// answers, so sessions stay open until something else ends them.
    async fn quiet_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/listen", listener.local_addr().unwrap());
        actix_web::rt::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                actix_web::rt::spawn(async move {
                    if let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = socket.next().await {}
                    }
                });
            }
        });
        url
    }

    async fn start_relay() -> (String, AppState, ServerHandle) {
        let mut config = AppConfig::default();
        config.upstream.api_key = "test-key".to_string();
        config.upstream.url = quiet_upstream().await;
        config.upstream.close_grace_ms = 100;
        let state = AppState::new(config);

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .route("/listen", web::get().to(listen))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        (format!("ws://{}/listen", addr), state, handle)
    }

    async fn next_frame(client: &mut ClientSocketStream) -> Message {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")
            .expect("connection ended")
            .unwrap()
    }

    async fn connect(url: &str) -> ClientSocketStream {
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        match next_frame(&mut client).await {
            Message::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "connection");
            }
            other => panic!("expected greeting, got {:?}", other),
        }
        client
    }

    #[actix_web::test]
    async fn test_ping_answered_and_close_releases_session() {
        let (url, state, server) = start_relay().await;
        let mut client = connect(&url).await;
        assert_eq!(state.registry.len(), 1);

        client.send(Message::Ping(b"hi".to_vec())).await.unwrap();
        assert_eq!(next_frame(&mut client).await, Message::Pong(b"hi".to_vec()));

        client.send(Message::Text("hello".to_string())).await.unwrap();
        match next_frame(&mut client).await {
            Message::Text(json) => assert!(json.contains("unsupported_message")),
            other => panic!("expected error message, got {:?}", other),
        }

        client.close(None).await.unwrap();
        assert!(state.registry.wait_until_empty(Duration::from_secs(5)).await);
        assert_eq!(state.registry.totals().closed, 1);

        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_shutdown_sends_notice_then_going_away() {
        let (url, state, server) = start_relay().await;
        let mut client = connect(&url).await;

        assert_eq!(state.registry.shutdown_all(), 1);

        match next_frame(&mut client).await {
            Message::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "error");
                assert_eq!(value["code"], "shutting_down");
            }
            other => panic!("expected shutdown notice, got {:?}", other),
        }
        match next_frame(&mut client).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(state.registry.wait_until_empty(Duration::from_secs(5)).await);

        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_upgrade_refused_while_draining() {
        let (url, state, server) = start_relay().await;
        state.registry.shutdown_all();

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
            Err(other) => panic!("expected HTTP 503, got {:?}", other),
            Ok(_) => panic!("upgrade accepted while draining"),
        }
        assert_eq!(state.registry.len(), 0);

        server.stop(false).await;
    }

    #[test]
    fn test_client_handle_serializes_messages() {
        let (mut handle, mut rx) = ClientHandle::new();
        handle.send(ServerMessage::connected("abc")).unwrap();

        match rx.try_recv().unwrap() {
            Outbound::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "connection");
                assert_eq!(value["status"], "connected");
                assert_eq!(value["sessionId"], "abc");
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_client_handle_closes_once() {
        let (mut handle, mut rx) = ClientHandle::new();
        handle.close(Some(CloseNotice::new(CloseNotice::GOING_AWAY, "bye")));
        handle.close(None);

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseNotice::new(CloseNotice::GOING_AWAY, "bye"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_client_handle_rejects_writes_after_close() {
        let (mut handle, _rx) = ClientHandle::new();
        handle.close(None);
        assert!(handle.send(ServerMessage::error("x", "y")).is_err());
        assert!(handle.ping().is_err());
    }

    #[test]
    fn test_client_handle_detects_dropped_actor() {
        let (mut handle, rx) = ClientHandle::new();
        drop(rx);
        let err = handle.ping().unwrap_err();
        assert_eq!(err.code(), "channel_send");
        // closing a handle whose actor is gone is still fine
        handle.close(None);
    }
}

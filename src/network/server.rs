//! WebSocket Relay Server
//!
//! Async WebSocket server for the two participants.
//! Handles admission at the handshake, per-connection read/write tasks,
//! and the graceful shutdown sweep.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::network::protocol::{Inbound, Outbound, CLOSE_REASON_ACK, CLOSE_REASON_SHUTDOWN};
use crate::session::registry::{ConnectionState, ParticipantId};
use crate::session::relay::{Admission, SessionManager};

/// Body of the capacity rejection response.
const SERVER_FULL_BODY: &str = "Server full";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Largest accepted message and frame, in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// How long an admitted socket may take to finish the upgrade.
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_message_size: 1024,
            outbound_queue: 32,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Create config from environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("RELAY_BIND_ADDR", defaults.bind_addr),
            max_message_size: env_or("RELAY_MAX_MESSAGE_SIZE", defaults.max_message_size),
            outbound_queue: env_or("RELAY_OUTBOUND_QUEUE", defaults.outbound_queue).max(1),
            handshake_timeout: Duration::from_secs(env_or(
                "RELAY_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout.as_secs(),
            )),
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        ws_config.max_frame_size = Some(self.max_message_size);
        ws_config
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind or query the listening socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket handshake or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Upgrade request did not arrive in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Server stopped while the connection was being set up.
    #[error("Server shutting down")]
    ShuttingDown,
}

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Participant sent a close frame with this code.
    PeerClosed(u16),
    /// Server is stopping.
    Shutdown,
    /// Read failed or the stream ended without a close frame.
    TransportLost,
}

/// The relay server.
pub struct RelayServer {
    /// Server configuration.
    config: RelayConfig,
    /// The two-party session.
    session: Arc<SessionManager>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a new relay server.
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            session: Arc::new(SessionManager::new()),
            shutdown_tx,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then close every
    /// connection and wait for their tasks to finish.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        info!("Server started on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            connections.spawn(Self::handle_connection(
                                stream,
                                addr,
                                self.session.clone(),
                                self.config.clone(),
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = stopped(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);

        let closing = self.session.close_all(CLOSE_REASON_SHUTDOWN).await;
        debug!("Queued close for {} connection(s)", closing);

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }

        info!("Server stopped.");
        Ok(())
    }

    /// Handle one inbound TCP connection from admission to release.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session: Arc<SessionManager>,
        config: RelayConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(config.outbound_queue);

        // Admit before upgrading so a full session is refused at the handshake.
        let admission = session.try_admit(msg_tx.clone()).await;
        let admitted = admission.is_ok();
        let callback = move |_req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if admitted {
                Ok(response)
            } else {
                Err(forbidden_response())
            }
        };

        // An admitted socket holds a slot, so the upgrade is bounded in time
        // and abandoned on shutdown.
        let upgrade = tokio::time::timeout(
            config.handshake_timeout,
            accept_hdr_async_with_config(stream, callback, Some(config.websocket_config())),
        );
        let handshake: Result<_, RelayError> = tokio::select! {
            result = upgrade => match result {
                Ok(Ok(ws)) => Ok(ws),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(RelayError::HandshakeTimeout(config.handshake_timeout)),
            },
            _ = stopped(&mut shutdown_rx) => Err(RelayError::ShuttingDown),
        };

        let (Admission { conn, participant }, ws_stream) = match (admission, handshake) {
            (Ok(admission), Ok(ws)) => (admission, ws),
            (Ok(admission), Err(e)) => {
                warn!("Handshake failed for {}: {}", addr, e);
                session.remove(&admission.conn).await;
                return;
            }
            (Err(e), _) => {
                debug!("Rejected {}: {}", addr, e);
                return;
            }
        };

        let mut state = ConnectionState::Open;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Spawn message sender task
        let sender_task = tokio::spawn(async move {
            while let Some(frame) = msg_rx.recv().await {
                let closing = frame.is_close();
                match ws_sender.send(frame.into_message()).await {
                    Ok(()) => {}
                    // Peer closed first; its echo is flushed by `close` below.
                    Err(WsError::Protocol(ProtocolError::SendAfterClosing)) => break,
                    Err(e) => {
                        debug!("Send to {} failed: {}", addr, e);
                        break;
                    }
                }
                if closing {
                    break;
                }
            }
            // Flushes the close reply tungstenite queued on a peer close.
            let _ = ws_sender.close().await;
        });

        // Handle incoming messages
        let departure = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(msg)) => match Inbound::from_message(msg) {
                            Inbound::Move(text) => {
                                let outcome = session.handle_frame(participant, text).await;
                                debug!("Participant {} move outcome: {:?}", participant, outcome);
                            }
                            Inbound::Close(code) => {
                                debug!("Participant {} sent close ({})", participant, code);
                                break Departure::PeerClosed(code);
                            }
                            Inbound::Malformed => {
                                warn!("Dropping non-UTF-8 frame from participant {}", participant);
                            }
                            Inbound::Ignored => {}
                        },
                        Some(Err(e)) => {
                            warn!("WebSocket error for participant {}: {}", participant, e);
                            break Departure::TransportLost;
                        }
                        None => {
                            break Departure::TransportLost;
                        }
                    }
                }
                _ = stopped(&mut shutdown_rx) => {
                    break Departure::Shutdown;
                }
            }
        };

        state = transition(participant, state, ConnectionState::Closing);
        session.mark_closing(&conn).await;

        let reply = match departure {
            Departure::PeerClosed(code) => Some(Outbound::Close {
                code,
                reason: CLOSE_REASON_ACK.to_string(),
            }),
            Departure::Shutdown => Some(Outbound::close(CLOSE_REASON_SHUTDOWN)),
            Departure::TransportLost => None,
        };

        match reply {
            Some(frame) => {
                // The close reply goes out before the slot is released. If it
                // cannot be queued, releasing the slot drops the last sender
                // and lets the writer drain and close instead.
                let queued = match msg_tx.try_send(frame) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Close for participant {} not queued: {}", participant, e);
                        false
                    }
                };
                drop(msg_tx);
                if !queued {
                    session.remove(&conn).await;
                }
                if let Err(e) = sender_task.await {
                    error!("Sender task for participant {} failed: {}", participant, e);
                }
                session.remove(&conn).await;
            }
            None => {
                drop(msg_tx);
                session.remove(&conn).await;
                sender_task.abort();
            }
        }

        transition(participant, state, ConnectionState::Closed);
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// The shared session.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.session.connection_count().await
    }

    /// Server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Resolves once shutdown is requested or the server is gone.
async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

fn transition(participant: ParticipantId, from: ConnectionState, to: ConnectionState) -> ConnectionState {
    debug!("Participant {} connection {:?} -> {:?}", participant, from, to);
    to
}

fn forbidden_response() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(SERVER_FULL_BODY.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    type Running = (Arc<RelayServer>, SocketAddr, JoinHandle<Result<(), RelayError>>);

    fn local_config() -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn start_server() -> Running {
        start_server_with(local_config()).await
    }

    async fn start_server_with(config: RelayConfig) -> Running {
        let server = Arc::new(RelayServer::new(config));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.serve(listener).await });
        (server, addr, handle)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        client
    }

    async fn recv_text(client: &mut Client) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame");
        match msg {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    async fn assert_silent(client: &mut Client) {
        let result = tokio::time::timeout(Duration::from_millis(150), client.next()).await;
        assert!(result.is_err(), "unexpected frame: {:?}", result);
    }

    async fn wait_for_count(server: &RelayServer, expected: usize) {
        for _ in 0..100 {
            if server.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection count never reached {}", expected);
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.outbound_queue, 32);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::HandshakeTimeout(Duration::from_millis(200));
        assert_eq!(err.to_string(), "Handshake timed out after 200ms");
        assert_eq!(RelayError::ShuttingDown.to_string(), "Server shutting down");
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_deref(), Some(SERVER_FULL_BODY));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = RelayServer::new(RelayConfig::default());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session().turn().await, ParticipantId::One);
    }

    #[tokio::test]
    async fn test_move_exchange() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;
        assert_eq!(server.session().participants().await, vec![ParticipantId::One, ParticipantId::Two]);

        p1.send(Message::Text("move:e4".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:e4");
        assert_eq!(server.session().turn().await, ParticipantId::Two);

        p1.send(Message::Text("move:e5".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.session().turn().await, ParticipantId::Two);

        p2.send(Message::Text("move:Nf3".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p1).await, "move:Nf3");
        assert_eq!(server.session().turn().await, ParticipantId::One);
        assert_silent(&mut p2).await;
    }

    #[tokio::test]
    async fn test_third_connection_forbidden() {
        let (server, addr, _handle) = start_server().await;
        let _p1 = connect(addr).await;
        let _p2 = connect(addr).await;

        let err = connect_async(format!("ws://{}", addr)).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(server.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_close_is_answered_with_same_code() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;

        let mut p2 = connect(addr).await;

        p1.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), p1.next()).await.unwrap();
        match reply {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("unexpected reply: {:?}", other),
        }
        wait_for_count(&server, 1).await;

        p2.close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "later".into(),
        }))
        .await
        .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), p2.next()).await.unwrap();
        match reply {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("unexpected reply: {:?}", other),
        }
        wait_for_count(&server, 0).await;
    }

    #[tokio::test]
    async fn test_move_after_peer_left() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;

        p1.send(Message::Text("move:e4".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:e4");

        p1.close(None).await.unwrap();
        wait_for_count(&server, 1).await;

        p2.send(Message::Text("move:e5".to_string())).await.unwrap();
        for _ in 0..100 {
            if server.session().turn().await == ParticipantId::One {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session().turn().await, ParticipantId::One);
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_freed_slot_is_reassigned() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let _p2 = connect(addr).await;

        p1.close(None).await.unwrap();
        wait_for_count(&server, 1).await;

        let _p3 = connect(addr).await;
        assert_eq!(server.session().participants().await, vec![ParticipantId::One, ParticipantId::Two]);
    }

    #[tokio::test]
    async fn test_malformed_binary_dropped() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;

        p1.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
        assert_silent(&mut p2).await;
        assert_eq!(server.session().turn().await, ParticipantId::One);

        p1.send(Message::Binary(b"move:d4".to_vec())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:d4");
    }

    #[tokio::test]
    async fn test_shutdown_closes_participants() {
        let (server, addr, handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;

        server.shutdown();

        for client in [&mut p1, &mut p2] {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next()).await.unwrap();
            match msg {
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(frame.code, CloseCode::Normal);
                    assert_eq!(frame.reason, CLOSE_REASON_SHUTDOWN);
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = RelayServer::new(RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        });
        server.shutdown();
        server.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_socket_releases_slot() {
        let config = RelayConfig {
            handshake_timeout: Duration::from_millis(200),
            ..local_config()
        };
        let (server, addr, _handle) = start_server_with(config).await;

        let _idle = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        wait_for_count(&server, 0).await;

        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;
        assert_eq!(server.session().participants().await, vec![ParticipantId::One, ParticipantId::Two]);

        p1.send(Message::Text("move:e4".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:e4");
    }

    #[tokio::test]
    async fn test_shutdown_with_pending_handshake() {
        let (server, addr, handle) = start_server().await;

        let _idle = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve did not return")
            .unwrap()
            .unwrap();
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_oversized_message_drops_only_sender() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;

        p1.send(Message::Text("move:e4".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:e4");

        let oversized = "x".repeat(server.config().max_message_size * 2);
        let _ = p2.send(Message::Text(oversized)).await;
        wait_for_count(&server, 1).await;
        assert_eq!(server.session().participants().await, vec![ParticipantId::One]);

        let mut p3 = connect(addr).await;
        p3.send(Message::Text("move:e5".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p1).await, "move:e5");
        assert_eq!(server.session().turn().await, ParticipantId::One);
    }

    #[tokio::test]
    async fn test_invalid_utf8_text_drops_only_sender() {
        let (server, addr, _handle) = start_server().await;
        let mut p1 = connect(addr).await;
        let mut p2 = connect(addr).await;

        let frame = Frame::message(vec![0xff, 0xfe, 0xfd], OpCode::Data(Data::Text), true);
        let _ = p1.send(Message::Frame(frame)).await;
        wait_for_count(&server, 1).await;
        assert_eq!(server.session().participants().await, vec![ParticipantId::Two]);
        assert_eq!(server.session().turn().await, ParticipantId::One);

        let mut p3 = connect(addr).await;
        p3.send(Message::Text("move:e4".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut p2).await, "move:e4");
        assert_eq!(server.session().turn().await, ParticipantId::Two);
    }
}

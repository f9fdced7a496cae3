//! WebSocket server implementation
//!
//! Listens on a single port, answers plain HTTP health checks, upgrades
//! WebSocket requests and hands each connection to the relay.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::handler::frame_to_event;
use super::routes::{build_router, AppState};
use crate::config::RelayConfig;
use crate::relay::{
    ClientConnection, ConnectionEvent, ConnectionState, Registry, Router, Session,
};

/// How long shutdown waits for connection tasks to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long a finished connection may spend flushing its queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Fan-out and transport settings
    pub relay: RelayConfig,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            relay: RelayConfig::default(),
        }
    }

    /// Set the relay configuration
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Relay server accepting WebSocket clients
pub struct WebSocketServer {
    config: ServerConfig,
    router: Arc<Router>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Router::new(Arc::new(Registry::new()), config.relay.router);
        Self {
            config,
            router: Arc::new(router),
            shutdown_tx,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server started on port {}", self.config.port);
        debug!("Listening on ws://{}", addr);

        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);

        let app = build_router(AppState {
            router: Arc::clone(&self.router),
            shutdown_tx: self.shutdown_tx.clone(),
            transport: self.config.relay.transport,
            drain: drain_tx,
        });

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, stopping server");
        })
        .await?;

        let registry = self.router.registry();
        if !registry.is_empty().await {
            info!(
                "Waiting for {} active connections to close...",
                registry.len().await
            );
        }

        // Upgraded sockets outlive the HTTP server; each holds a drain sender
        if time::timeout(SHUTDOWN_GRACE, drain_rx.recv()).await.is_err() {
            warn!(
                "Abandoning {} connections still open after {:?}",
                registry.len().await,
                SHUTDOWN_GRACE
            );
        }

        Ok(())
    }
}

/// Drive one upgraded socket until it closes
pub(super) async fn handle_socket(socket: WebSocket, peer_addr: SocketAddr, state: AppState) {
    let AppState {
        router,
        shutdown_tx,
        transport,
        drain,
    } = state;

    let (ws_sender, ws_receiver) = socket.split();
    let (connection, outbound_rx) =
        ClientConnection::new(Some(peer_addr), transport.outbound_queue);
    let writer = tokio::spawn(write_loop(ws_sender, outbound_rx));

    let session = Session::new(router, connection);
    drive_session(session, ws_receiver, writer, shutdown_tx.subscribe()).await;

    debug!("Connection from {} closed", peer_addr);
    drop(drain);
}

/// Feed socket reads, writer failure and shutdown into the session
///
/// Returns once the session reaches `Closed`. A failed writer is reported
/// to the session as an error so the connection is deregistered right away
/// instead of waiting for the read side to notice.
async fn drive_session<R, E>(
    mut session: Session,
    mut frames: R,
    mut writer: JoinHandle<anyhow::Result<()>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    session.handle(ConnectionEvent::Opened).await;
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = frames.next() => {
                if let Some(event) = frame_to_event(frame) {
                    if session.handle(event).await == ConnectionState::Closed {
                        break;
                    }
                }
            }
            result = &mut writer => {
                writer_done = true;
                let event = match result {
                    Ok(Ok(())) => ConnectionEvent::Closed,
                    Ok(Err(e)) => ConnectionEvent::Error(format!("write failed: {}", e)),
                    Err(e) => ConnectionEvent::Error(format!("writer task failed: {}", e)),
                };
                session.handle(event).await;
                break;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to Client {}", session.label());
                session.handle(ConnectionEvent::Closed).await;
                break;
            }
        }
    }

    // The writer finishes once the last handle to the queue is gone
    drop(session);
    if !writer_done {
        match time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("Writer stopped while draining: {}", e),
            Ok(Err(e)) => warn!("Writer task failed: {}", e),
            Err(_) => warn!("Writer did not drain in time"),
        }
    }
}

/// Drain a connection's outbound queue into the socket
///
/// Ends with an error on the first failed write, or cleanly with a Close
/// frame once every handle to the queue is gone.
async fn write_loop<S>(
    mut ws_sender: S,
    mut outbound_rx: mpsc::Receiver<Arc<str>>,
) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    while let Some(text) = outbound_rx.recv().await {
        if let Err(e) = ws_sender.send(Message::Text(text.to_string().into())).await {
            error!("Write failed, closing outbound side: {}", e);
            return Err(e.into());
        }
    }

    // Sends a Close frame unless the peer already closed
    let _ = ws_sender.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use futures_util::{sink, stream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::relay::{ConnectionId, RouterConfig};
    use crate::server::routes::HEALTH_BODY;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(
        relay: RelayConfig,
    ) -> (
        Arc<WebSocketServer>,
        SocketAddr,
        JoinHandle<anyhow::Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig::new("127.0.0.1".to_string(), addr.port()).with_relay(relay);
        let server = Arc::new(WebSocketServer::new(config));

        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await });
        (server, addr, handle)
    }

    async fn connect_to(addr: SocketAddr, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", addr, path))
            .await
            .unwrap();
        ws
    }

    async fn connect(addr: SocketAddr) -> Client {
        connect_to(addr, "/").await
    }

    async fn recv_text(ws: &mut Client) -> String {
        loop {
            let msg = time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("websocket error");
            if let ClientMessage::Text(text) = msg {
                return text;
            }
        }
    }

    async fn assert_silent(ws: &mut Client) {
        let result = time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(result.is_err(), "expected no message, got {:?}", result);
    }

    async fn wait_for_connections(server: &WebSocketServer, expected: usize) {
        for _ in 0..100 {
            if server.router().registry().len().await == expected {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        panic!("registry never reached {} connections", expected);
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .expect("timed out reading response")
            .unwrap();
        response
    }

    fn relay_router() -> Arc<Router> {
        Arc::new(Router::new(
            Arc::new(Registry::new()),
            RouterConfig::default(),
        ))
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.relay, RelayConfig::default());
    }

    #[test]
    fn test_server_config_with_relay() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080)
            .with_relay(RelayConfig::default().exclude_sender());
        assert!(!config.relay.router.include_sender);
    }

    #[tokio::test]
    async fn test_write_loop_reports_failed_write() {
        let broken = Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }));
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::from("hello")).await.unwrap();

        let result = write_loop(broken, rx).await;
        assert!(result.unwrap_err().to_string().contains("peer gone"));
    }

    #[tokio::test]
    async fn test_failed_writer_deregisters_connection() {
        let router = relay_router();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Every write fails, starting with the welcome
        let broken = Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }));
        let (connection, outbound_rx) = ClientConnection::new(None, 8);
        let writer = tokio::spawn(write_loop(broken, outbound_rx));

        // The read side never reports anything
        let frames = stream::pending::<Result<Message, io::Error>>();
        let session = Session::new(Arc::clone(&router), Arc::clone(&connection));

        time::timeout(
            Duration::from_secs(5),
            drive_session(session, frames, writer, shutdown_rx),
        )
        .await
        .expect("session kept running after its writer failed");

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(router.registry().get(ConnectionId::new(1)).await.is_none());
        assert!(router.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_to_all_clients() {
        let (server, addr, _handle) = start(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        assert_eq!(recv_text(&mut a).await, "Say Hello, Client 1");
        let mut b = connect(addr).await;
        assert_eq!(recv_text(&mut b).await, "Say Hello, Client 2");
        wait_for_connections(&server, 2).await;

        a.send(ClientMessage::Text("hi".to_string())).await.unwrap();

        assert_eq!(recv_text(&mut b).await, "Client 1: hi");
        assert_eq!(recv_text(&mut a).await, "Client 1: hi");
    }

    #[tokio::test]
    async fn test_upgrade_on_any_path() {
        let (server, addr, _handle) = start(RelayConfig::default()).await;

        let mut a = connect_to(addr, "/chat/room").await;
        assert_eq!(recv_text(&mut a).await, "Say Hello, Client 1");
        let mut b = connect(addr).await;
        assert_eq!(recv_text(&mut b).await, "Say Hello, Client 2");
        wait_for_connections(&server, 2).await;

        b.send(ClientMessage::Text("hello".to_string())).await.unwrap();
        assert_eq!(recv_text(&mut a).await, "Client 2: hello");
    }

    #[tokio::test]
    async fn test_exclude_sender() {
        let (server, addr, _handle) = start(RelayConfig::default().exclude_sender()).await;

        let mut a = connect(addr).await;
        recv_text(&mut a).await;
        let mut b = connect(addr).await;
        recv_text(&mut b).await;
        wait_for_connections(&server, 2).await;

        a.send(ClientMessage::Text("only for b".to_string()))
            .await
            .unwrap();

        assert_eq!(recv_text(&mut b).await, "Client 1: only for b");
        assert_silent(&mut a).await;
    }

    #[tokio::test]
    async fn test_binary_frames_relayed_as_text() {
        let (_server, addr, _handle) = start(RelayConfig::default().untagged()).await;

        let mut a = connect(addr).await;
        recv_text(&mut a).await;

        a.send(ClientMessage::Binary(b"raw".to_vec())).await.unwrap();
        assert_eq!(recv_text(&mut a).await, "raw");
    }

    #[tokio::test]
    async fn test_identity_not_reused() {
        let (server, addr, _handle) = start(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        assert_eq!(recv_text(&mut a).await, "Say Hello, Client 1");
        a.close(None).await.unwrap();
        wait_for_connections(&server, 0).await;

        let mut b = connect(addr).await;
        assert_eq!(recv_text(&mut b).await, "Say Hello, Client 2");
    }

    #[tokio::test]
    async fn test_dropped_client_is_deregistered() {
        let (server, addr, _handle) = start(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        recv_text(&mut a).await;
        let mut b = connect(addr).await;
        recv_text(&mut b).await;
        wait_for_connections(&server, 2).await;

        // No close handshake, just gone
        drop(a);
        wait_for_connections(&server, 1).await;

        b.send(ClientMessage::Text("anyone?".to_string()))
            .await
            .unwrap();
        assert_eq!(recv_text(&mut b).await, "Client 2: anyone?");
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let mut relay = RelayConfig::default().exclude_sender();
        relay.transport.outbound_queue = 16;
        let (server, addr, _handle) = start(relay).await;

        let mut a = connect(addr).await;
        recv_text(&mut a).await;
        let mut b = connect(addr).await;
        recv_text(&mut b).await;
        let mut c = connect(addr).await;
        recv_text(&mut c).await;
        wait_for_connections(&server, 3).await;

        // A stops reading; enough data to fill its socket buffers and queue
        let payload = "x".repeat(128 * 1024);
        for _ in 0..256 {
            b.send(ClientMessage::Text(payload.clone())).await.unwrap();
            let text = recv_text(&mut c).await;
            assert!(text.starts_with("Client 2: "));
            assert_eq!(text.len(), "Client 2: ".len() + payload.len());
        }

        let stalled = server
            .router()
            .registry()
            .get(ConnectionId::new(1))
            .await
            .expect("stalled client should stay registered");
        assert!(stalled.is_open());
        assert!(stalled.drop_count() > 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_server, addr, _handle) = start(RelayConfig::default()).await;

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
        assert!(response.ends_with(HEALTH_BODY));
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (_server, addr, _handle) = start(RelayConfig::default()).await;

        let response = http_get(addr, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, addr, handle) = start(RelayConfig::default()).await;

        let mut a = connect(addr).await;
        recv_text(&mut a).await;
        wait_for_connections(&server, 1).await;

        server.shutdown();

        // Close frame, or the stream simply ends
        let next = time::timeout(Duration::from_secs(5), a.next()).await.unwrap();
        assert!(matches!(
            next,
            Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_))
        ));

        handle.await.unwrap().unwrap();
        assert!(server.router().registry().is_empty().await);
    }
}

//! Listeners and HTTP routes for the Murmur server.
//!
//! This module accepts connections from every enabled transport and hands
//! each one to a [`ConnectionHandler`].

use crate::config::Config;
use crate::connection::{ConnectionHandler, HandlerConfig};
use crate::metrics;
use anyhow::{bail, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use murmur_core::Relay;
use murmur_transport::{
    Connection, TcpConfig, TcpTransport, Transport, TransportError, WebSocketConnection,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Hard cap on WebSocket messages, above which the socket itself errors.
/// Frames between `max_frame_size` and this get a `frame_too_large` reply.
const WS_HARD_LIMIT_FACTOR: usize = 4;

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub relay: Arc<Relay>,
    /// Per-connection settings.
    pub handler: HandlerConfig,
    /// Server configuration.
    pub config: Config,
    connections: Arc<Semaphore>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            relay: Arc::new(Relay::with_config(config.relay_config())),
            handler: HandlerConfig::from_config(&config),
            connections: Arc::new(Semaphore::new(config.limits.max_connections)),
            config,
        }
    }

    /// Reserve a connection slot, if one is free.
    fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let permit = self.connections.clone().try_acquire_owned().ok();
        if permit.is_none() {
            warn!(
                max_connections = self.config.limits.max_connections,
                "Connection limit reached, refusing connection"
            );
            metrics::record_rejected_connection();
        }
        permit
    }

    /// Run a connection to completion while holding its slot.
    async fn serve(self: Arc<Self>, connection: Box<dyn Connection>, permit: OwnedSemaphorePermit) {
        let handler =
            ConnectionHandler::new(self.relay.clone(), self.handler.clone(), connection.as_ref());
        handler.run(connection).await;
        drop(permit);
    }
}

/// Run every enabled listener until one of them fails.
///
/// # Errors
///
/// Returns an error if no transport is enabled or a listener fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if !config.transport.tcp && !config.transport.websocket {
        bail!("No transport enabled; enable transport.tcp or transport.websocket");
    }

    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let mut listeners = tokio::task::JoinSet::new();

    if config.transport.tcp {
        let transport = TcpTransport::new(TcpConfig {
            bind_addr: config.bind_addr()?,
            max_frame_size: config.limits.max_frame_size,
        })
        .await?;
        listeners.spawn(serve_transport(Arc::new(transport), state.clone()));
    }

    if config.transport.websocket {
        let addr = config.websocket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Murmur WebSocket listening on {}", addr);
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, config.transport.websocket_path
        );

        let app = app(state.clone());
        listeners.spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!("HTTP server failed: {}", e);
            }
        });
    }

    // Listeners only return on failure.
    listeners.join_next().await;
    bail!("Listener stopped unexpectedly")
}

/// Accept connections from a transport until it shuts down.
pub async fn serve_transport(transport: Arc<dyn Transport>, state: Arc<AppState>) {
    info!(transport = transport.name(), "Accepting connections");

    loop {
        let connection = match transport.accept().await {
            Ok(connection) => connection,
            Err(TransportError::ConnectionClosed) => {
                debug!(transport = transport.name(), "Transport closed");
                return;
            }
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error("accept");
                continue;
            }
        };

        let Some(permit) = state.admit() else {
            // Dropping the connection closes it.
            continue;
        };
        tokio::spawn(state.clone().serve(connection, permit));
    }
}

/// The HTTP router: WebSocket endpoint and health check.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": murmur_protocol::PROTOCOL_VERSION.to_string(),
        "clients": state.relay.registry().len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(permit) = state.admit() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let max_frame_size = state.config.limits.max_frame_size;
    ws.max_message_size(max_frame_size.saturating_mul(WS_HARD_LIMIT_FACTOR))
        .on_upgrade(move |socket| {
            let connection = WebSocketConnection::new(socket, Some(addr), max_frame_size);
            state.serve(Box::new(connection), permit)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::{codec, Command, Event};
    use murmur_transport::MemoryTransport;
    use std::time::Duration;

    fn state_with(config: Config) -> Arc<AppState> {
        Arc::new(AppState::new(config))
    }

    async fn next(client: &mut murmur_transport::MemoryClient) -> Option<Event> {
        tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_serve_transport_end_to_end() {
        let state = state_with(Config::default());
        let transport = Arc::new(MemoryTransport::new());
        let connector = transport.connector();
        tokio::spawn(serve_transport(transport, state.clone()));

        let mut a = connector.connect().await.unwrap();
        a.send(&Command::username("A")).await.unwrap();
        assert_eq!(next(&mut a).await.unwrap().kind(), "welcome");

        let mut b = connector.connect().await.unwrap();
        b.send(&Command::username("B")).await.unwrap();
        assert_eq!(next(&mut b).await.unwrap().kind(), "welcome");
        assert_eq!(next(&mut a).await.unwrap().kind(), "user_joined");

        b.send(&Command::whisper("A", "psst")).await.unwrap();
        match next(&mut a).await.unwrap() {
            Event::Whisper { from, text, .. } => {
                assert_eq!(from, "B");
                assert_eq!(text, "psst");
            }
            other => panic!("Expected whisper, got {:?}", other),
        }
        assert_eq!(next(&mut b).await.unwrap().kind(), "whisper_sent");
        assert_eq!(state.relay.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let state = state_with(config);
        let transport = Arc::new(MemoryTransport::new());
        let connector = transport.connector();
        tokio::spawn(serve_transport(transport, state.clone()));

        let mut first = connector.connect().await.unwrap();
        first.send(&Command::username("first")).await.unwrap();
        assert_eq!(next(&mut first).await.unwrap().kind(), "welcome");

        // Refused: closed without a reply.
        let mut second = connector.connect().await.unwrap();
        assert!(next(&mut second).await.is_none());

        // The slot frees up once the first client leaves.
        first.close().await.unwrap();
        assert!(next(&mut first).await.is_none());
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.connections.available_permits() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let mut third = connector.connect().await.unwrap();
        third.send(&Command::username("third")).await.unwrap();
        assert_eq!(next(&mut third).await.unwrap().kind(), "welcome");
    }

    #[tokio::test]
    async fn test_health_and_websocket_endpoint() {
        use futures_util::{SinkExt, StreamExt};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio_tungstenite::tungstenite::Message;

        let state = state_with(Config::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        let hello = codec::encode(&Command::username("web")).unwrap();
        ws.send(Message::Text(String::from_utf8(hello.to_vec()).unwrap()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let event = codec::decode_event(reply.into_text().unwrap().as_bytes()).unwrap();
        match event {
            Event::Welcome { username, .. } => assert_eq!(username, "web"),
            other => panic!("Expected welcome, got {:?}", other),
        }
        assert_eq!(state.relay.registry().names(), vec!["web".to_string()]);

        // Health check over plain HTTP.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"clients\":1"));
    }
}

//! WebSocket Signaling Relay
//!
//! A dumb fan-out hub for signaling envelopes, plus the client that talks to
//! it. The hub checks that frames are well-formed envelopes and forwards
//! them to every other connected client. It never looks at game state and
//! never carries channel traffic.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::signaling::{Envelope, SignalError, SignalInbox, SignalingTransport};

// =============================================================================
// HUB
// =============================================================================

/// Relay hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-client outbound queue depth. Frames beyond it are dropped.
    pub client_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            max_connections: 1000,
            client_queue: 256,
        }
    }
}

impl HubConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: std::env::var("EMBER_HUB_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.bind_addr),
            max_connections: std::env::var("EMBER_HUB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_connections),
            client_queue: std::env::var("EMBER_HUB_CLIENT_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.client_queue),
        }
    }
}

/// Relay hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct HubClient {
    /// Outbound frames.
    sender: mpsc::Sender<String>,
    /// Connection time.
    connected_at: Instant,
    /// Frames relayed from this client.
    relayed: u64,
}

/// The relay hub.
pub struct SignalHub {
    config: HubConfig,
    clients: Arc<RwLock<BTreeMap<SocketAddr, HubClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SignalHub {
    /// Create a new hub.
    pub fn new(config: HubConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, HubError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        info!("Signal hub listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let queue = self.config.client_queue.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<String>(queue);

            clients.write().await.insert(addr, HubClient {
                sender: msg_tx,
                connected_at: Instant::now(),
                relayed: 0,
            });

            let sender_task = tokio::spawn(async move {
                while let Some(text) = msg_rx.recv().await {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = Envelope::from_json(&text) {
                                    debug!("Invalid envelope from {}: {}", addr, e);
                                    continue;
                                }
                                Self::relay(addr, text, &clients).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            sender_task.abort();

            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    "Client {} cleaned up after {:?}, {} envelopes relayed",
                    addr,
                    client.connected_at.elapsed(),
                    client.relayed
                );
            }
        });
    }

    /// Forward one frame to everyone but its sender.
    async fn relay(
        from: SocketAddr,
        text: String,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, HubClient>>>,
    ) {
        let mut clients = clients.write().await;
        if let Some(client) = clients.get_mut(&from) {
            client.relayed += 1;
        }
        for (addr, client) in clients.iter().filter(|(addr, _)| **addr != from) {
            if client.sender.try_send(text.clone()).is_err() {
                warn!("Dropping envelope for slow client {}", addr);
            }
        }
    }

    /// Shutdown the hub.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Signaling over a relay hub.
#[derive(Debug)]
pub struct RelaySignaling {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: broadcast::Sender<String>,
}

impl RelaySignaling {
    /// Connect to a hub, e.g. `ws://127.0.0.1:8787`.
    pub async fn connect(url: &str) -> Result<Self, SignalError> {
        info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, _) = broadcast::channel::<String>(1024);
        let incoming = incoming_tx.clone();

        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let _ = incoming.send(text);
                    }
                    Ok(Message::Close(_)) => {
                        info!("Hub closed connection");
                        break;
                    }
                    Err(e) => {
                        error!("Hub read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        tokio::spawn(async move {
            while let Some(json) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(json)).await {
                    error!("Failed to send envelope: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            reader_handle.abort();
        });

        Ok(Self { outgoing: outgoing_tx, incoming: incoming_tx })
    }
}

impl SignalingTransport for RelaySignaling {
    fn publish(&self, envelope: &Envelope) -> Result<(), SignalError> {
        self.outgoing
            .send(envelope.to_json()?)
            .map_err(|_| SignalError::Unavailable)
    }

    fn subscribe(&self) -> SignalInbox {
        SignalInbox::new(self.incoming.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{PeerId, RoomCode};
    use crate::network::signaling::SignalKind;
    use std::time::Duration;

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.bind_addr.port(), 8787);
        assert_eq!(config.max_connections, 1000);
    }

    async fn wait_for_clients(hub: &SignalHub, n: usize) {
        for _ in 0..100 {
            if hub.connection_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("hub never saw {n} clients");
    }

    #[tokio::test]
    async fn test_hub_relays_to_others_only() {
        let hub = Arc::new(SignalHub::new(HubConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }));
        let listener = hub.bind().await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = hub.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let a = RelaySignaling::connect(&url).await.unwrap();
        let b = RelaySignaling::connect(&url).await.unwrap();
        let mut a_inbox = a.subscribe();
        let mut b_inbox = b.subscribe();
        wait_for_clients(&hub, 2).await;

        let room = RoomCode::parse("ROOM42").unwrap();
        let env = Envelope::broadcast(SignalKind::HostReady, room, PeerId::new("a"));
        a.publish(&env).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), b_inbox.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, env);

        let echo = tokio::time::timeout(Duration::from_millis(200), a_inbox.next()).await;
        assert!(echo.is_err(), "publisher must not receive its own envelope");

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_hub_shutdown() {
        let hub = SignalHub::new(HubConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        });
        assert_eq!(hub.connection_count().await, 0);
        hub.shutdown();
    }
}

//! WebSocket Direct Transport
//!
//! A direct link over a plain WebSocket. The offerer opens an ephemeral
//! listener and publishes its addresses as candidates; the answerer dials
//! them in arrival order and proves it holds the offer by sending a one-shot
//! link token as its first frame. The first authenticated socket becomes the
//! channel.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::network::transport::{
    Connection, DirectTransport, IceCandidate, LinkContext, LinkSignal, SessionDescription,
    TransportError,
};

const SDP_PREFIX: &str = "ember-ws/1 token=";
const HELLO_PREFIX: &str = "ember-link ";
const HELLO_ACK: &str = "ember-link ok";

/// WebSocket transport configuration.
#[derive(Clone, Debug)]
pub struct WsTransportConfig {
    /// Interface the offerer's listener binds to.
    pub bind_host: String,
    /// Hosts advertised as candidates, each paired with the listener port.
    pub advertise_hosts: Vec<String>,
    /// How long an accepted socket has to present the link token.
    pub hello_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            advertise_hosts: vec!["127.0.0.1".to_string()],
            hello_timeout: Duration::from_secs(5),
        }
    }
}

impl WsTransportConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let advertise_hosts = std::env::var("EMBER_WS_ADVERTISE")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or(d.advertise_hosts);
        Self {
            bind_host: std::env::var("EMBER_WS_BIND_HOST").unwrap_or(d.bind_host),
            advertise_hosts,
            hello_timeout: std::env::var("EMBER_WS_HELLO_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(d.hello_timeout),
        }
    }
}

/// Direct links over WebSocket. Must be used from within a Tokio runtime.
#[derive(Clone, Debug, Default)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    /// Create a transport.
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }
}

fn parse_token(description: &SessionDescription) -> Result<String, TransportError> {
    description
        .sdp
        .strip_prefix(SDP_PREFIX)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .ok_or_else(|| TransportError::InvalidDescription(description.sdp.clone()))
}

impl DirectTransport for WsTransport {
    fn create_offer(
        &self,
        ctx: LinkContext,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError> {
        let std_listener = std::net::TcpListener::bind((self.config.bind_host.as_str(), 0))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let port = listener.local_addr()?.port();

        let token = uuid::Uuid::new_v4().simple().to_string();
        for host in &self.config.advertise_hosts {
            ctx.emit(LinkSignal::LocalCandidate(IceCandidate::new(format!("{host}:{port}"))));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let hello = format!("{HELLO_PREFIX}{token}");
        let hello_timeout = self.config.hello_timeout;

        tokio::spawn(async move {
            let accepted = tokio::select! {
                result = accept_link(listener, &hello, hello_timeout) => result,
                _ = &mut cancel_rx => return,
            };
            match accepted {
                Ok(ws) => {
                    ctx.emit(LinkSignal::Open);
                    run_socket(ws, outbound_rx, ctx).await;
                }
                Err(e) => ctx.emit(LinkSignal::Failed(e.to_string())),
            }
        });

        let offer = SessionDescription::offer(format!("{SDP_PREFIX}{token}"));
        let conn = WsConnection {
            token,
            outbound: Some(outbound_tx),
            dial: None,
            cancel: Some(cancel_tx),
        };
        Ok((Box::new(conn), offer))
    }

    fn create_answer(
        &self,
        ctx: LinkContext,
        offer: &SessionDescription,
    ) -> Result<(Box<dyn Connection>, SessionDescription), TransportError> {
        let token = parse_token(offer)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let hello = format!("{HELLO_PREFIX}{token}");
        let ack_timeout = self.config.hello_timeout;

        tokio::spawn(async move {
            let dialed = tokio::select! {
                ws = dial_link(dial_rx, hello, ack_timeout) => ws,
                _ = &mut cancel_rx => return,
            };
            if let Some(ws) = dialed {
                ctx.emit(LinkSignal::Open);
                run_socket(ws, outbound_rx, ctx).await;
            }
        });

        let answer = SessionDescription::answer(format!("{SDP_PREFIX}{token}"));
        let conn = WsConnection {
            token,
            outbound: Some(outbound_tx),
            dial: Some(dial_tx),
            cancel: Some(cancel_tx),
        };
        Ok((Box::new(conn), answer))
    }
}

/// Accept sockets until one presents the expected hello.
async fn accept_link(
    listener: TcpListener,
    hello: &str,
    hello_timeout: Duration,
) -> Result<WebSocketStream<TcpStream>, std::io::Error> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket handshake failed for {}: {}", addr, e);
                continue;
            }
        };
        match tokio::time::timeout(hello_timeout, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) if text == hello => {
                if let Err(e) = ws.send(Message::Text(HELLO_ACK.to_string())).await {
                    debug!("Ack to {} failed: {}", addr, e);
                    continue;
                }
                info!("Direct link accepted from {}", addr);
                return Ok(ws);
            }
            _ => {
                warn!("Rejecting direct link from {}: bad or missing token", addr);
                let _ = ws.close(None).await;
            }
        }
    }
}

/// Dial candidates in arrival order until one acknowledges the hello.
async fn dial_link(
    mut candidates: mpsc::UnboundedReceiver<SocketAddr>,
    hello: String,
    ack_timeout: Duration,
) -> Option<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    while let Some(addr) = candidates.recv().await {
        let url = format!("ws://{addr}/");
        let mut ws = match connect_async(url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                debug!("Dial {} failed: {}", addr, e);
                continue;
            }
        };
        if let Err(e) = ws.send(Message::Text(hello.clone())).await {
            debug!("Hello to {} failed: {}", addr, e);
            continue;
        }
        match tokio::time::timeout(ack_timeout, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) if text == HELLO_ACK => {
                info!("Direct link established to {}", addr);
                return Some(ws);
            }
            _ => debug!("{} did not acknowledge the link token", addr),
        }
    }
    None
}

/// Pump frames between the socket and the link's queues until either side
/// goes away.
async fn run_socket<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    ctx: LinkContext,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        ctx.emit(LinkSignal::Failed(e.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => ctx.emit(LinkSignal::Message(text)),
                Some(Ok(Message::Close(_))) | None => {
                    ctx.emit(LinkSignal::Closed);
                    return;
                }
                Some(Err(e)) => {
                    ctx.emit(LinkSignal::Failed(e.to_string()));
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// One end of a WebSocket link.
#[derive(Debug)]
pub struct WsConnection {
    token: String,
    outbound: Option<mpsc::UnboundedSender<String>>,
    dial: Option<mpsc::UnboundedSender<SocketAddr>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Connection for WsConnection {
    fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        if self.dial.is_some() {
            return Err(TransportError::InvalidState("only the offerer applies an answer"));
        }
        if parse_token(answer)? != self.token {
            return Err(TransportError::InvalidDescription("answer for another offer".to_string()));
        }
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let addr: SocketAddr = candidate
            .candidate
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidCandidate(candidate.candidate.clone()))?;
        if let Some(dial) = &self.dial {
            dial.send(addr).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(text.to_string()).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        // Dropping the senders ends the socket task gracefully.
        self.cancel.take();
        self.outbound.take();
        self.dial.take();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::PeerId;
    use crate::network::transport::{LinkEvent, LinkId};

    fn ctx(local: &str, peer: &str) -> (LinkContext, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkContext::new(PeerId::new(local), PeerId::new(peer), LinkId(1), tx), rx)
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkSignal {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
            .signal
    }

    #[tokio::test]
    async fn test_loopback_link() {
        let transport = WsTransport::default();
        let (host_ctx, mut host_rx) = ctx("h", "j");
        let (join_ctx, mut join_rx) = ctx("j", "h");

        let (mut host, offer) = transport.create_offer(host_ctx).unwrap();
        let candidate = match next_signal(&mut host_rx).await {
            LinkSignal::LocalCandidate(c) => c,
            other => panic!("expected candidate, got {other:?}"),
        };
        let (mut joiner, answer) = transport.create_answer(join_ctx, &offer).unwrap();
        joiner.add_remote_candidate(&candidate).unwrap();
        host.apply_answer(&answer).unwrap();

        assert_eq!(next_signal(&mut host_rx).await, LinkSignal::Open);
        assert_eq!(next_signal(&mut join_rx).await, LinkSignal::Open);

        joiner.send("ping").unwrap();
        assert_eq!(next_signal(&mut host_rx).await, LinkSignal::Message("ping".into()));
        host.send("pong").unwrap();
        assert_eq!(next_signal(&mut join_rx).await, LinkSignal::Message("pong".into()));

        joiner.close();
        assert_eq!(next_signal(&mut host_rx).await, LinkSignal::Closed);
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let transport = WsTransport::default();
        let (host_ctx, mut host_rx) = ctx("h", "j");
        let (_host, _offer) = transport.create_offer(host_ctx).unwrap();
        let candidate = match next_signal(&mut host_rx).await {
            LinkSignal::LocalCandidate(c) => c,
            other => panic!("expected candidate, got {other:?}"),
        };

        let (join_ctx, mut join_rx) = ctx("j", "h");
        let forged = SessionDescription::offer(format!("{SDP_PREFIX}forged"));
        let (mut joiner, _) = transport.create_answer(join_ctx, &forged).unwrap();
        joiner.add_remote_candidate(&candidate).unwrap();

        // The forger's socket is turned away and neither end opens.
        let host_quiet = tokio::time::timeout(Duration::from_millis(300), host_rx.recv()).await;
        assert!(host_quiet.is_err());
        let join_quiet = tokio::time::timeout(Duration::from_millis(300), join_rx.recv()).await;
        assert!(join_quiet.is_err());
    }

    #[test]
    fn test_bad_candidate_rejected() {
        let mut conn = WsConnection { token: "t".into(), outbound: None, dial: None, cancel: None };
        assert!(matches!(
            conn.add_remote_candidate(&IceCandidate::new("not-an-address")),
            Err(TransportError::InvalidCandidate(_))
        ));
        assert!(matches!(conn.send("x"), Err(TransportError::Closed)));
    }
}

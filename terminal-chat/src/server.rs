use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ServerArgs,
    config::ServerConfig,
    headers::CredentialHeaders,
    registry::{self, ConnectionRegistry, Outbound, RouteError, SessionHandle, SessionId},
    security::{Security, SessionKey},
};

pub const REJECTED_REASON: &str =
    "Invalid authorization header or username header is already registered on the server.";
pub const INVALID_MESSAGE_REASON: &str =
    "Invalid message. Make sure it is encrypted with the same cryptography key from the server.";

/// How long a peer has to complete the WebSocket upgrade after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the writer may keep flushing queued frames after a session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures::stream::SplitStream<WebSocketStream<TcpStream>>;

pub struct Server {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    handshake_timeout: Duration,
}

impl Server {
    pub fn new(listener: TcpListener, config: &ServerConfig, key: &SessionKey) -> Self {
        let security = Security::new(key, config.rounds);
        Self {
            listener,
            registry: Arc::new(ConnectionRegistry::new(security, config.password.clone())),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            handshake_timeout,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, handshake_timeout);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Binds the relay, prints the address and the freshly generated key for the
/// operator, and serves until ctrl-c.
pub async fn run(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::try_from(args)?;
    let key = SessionKey::generate();

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    let server = Server::new(listener, &config, &key);
    let addr = server.local_addr()?;

    println!("Server listening on ws://{addr}/");
    println!("Copy this key, every client needs it to connect: {}", key.encode());
    info!(%addr, rounds = %config.rounds, "relay started");

    server.run_until_ctrl_c().await?;
    println!("Server has been stopped.");
    Ok(())
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<ConnectionRegistry>,
    handshake_timeout: Duration,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry, handshake_timeout),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<ConnectionRegistry>,
    handshake_timeout: Duration,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, registry, handshake_timeout).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    handshake_timeout: Duration,
) -> Result<()> {
    let mut headers = CredentialHeaders::default();
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        headers = CredentialHeaders::from_header_map(request.headers());
        Ok(response)
    });
    let ws = timeout(handshake_timeout, handshake)
        .await
        .with_context(|| format!("websocket handshake timed out after {handshake_timeout:?}"))?
        .context("websocket handshake failed")?;

    let (sink, source) = ws.split();
    let (outbox, outbox_rx) = registry::outbox();
    let mut writer = tokio::spawn(forward_outbox(sink, outbox_rx, peer));

    let session = SessionHandle::new(registry.next_session_id(), peer, outbox.clone());
    let id = session.id();
    run_session(&registry, session, &headers, source, &outbox).await;

    // Runs whichever way the session ended; a no-op if it never registered.
    registry.unregister(id).await;
    drop(outbox);

    // A peer that stopped reading can hold the writer on a full socket.
    match timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(joined) => joined.context("connection writer task panicked")?,
        Err(_) => {
            debug!(%peer, "writer did not drain in time, aborting");
            writer.abort();
        }
    }
    Ok(())
}

async fn run_session(
    registry: &ConnectionRegistry,
    session: SessionHandle,
    headers: &CredentialHeaders,
    mut source: WsSource,
    outbox: &mpsc::Sender<Outbound>,
) {
    let peer = session.remote_addr();
    let id = session.id();
    let mut membership = session.membership();

    if let Err(err) = registry.register(session, headers).await {
        warn!(%peer, %err, "connection rejected");
        close_with_policy_violation(outbox, REJECTED_REASON);
        return;
    }

    while let Some(frame) = next_frame(&mut source, &mut membership).await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(%peer, error = ?err, "receive failed");
                break;
            }
        };

        if let Err(err) = route_frame(registry, id, &payload).await {
            warn!(%peer, %err, "closing connection after invalid frame");
            close_with_policy_violation(outbox, INVALID_MESSAGE_REASON);
            break;
        }
    }
}

/// The next frame from the peer, or `None` once the peer is gone or the
/// registry has evicted this session.
async fn next_frame(
    source: &mut WsSource,
    membership: &mut watch::Receiver<()>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    select! {
        frame = source.next() => frame,
        _ = membership.changed() => None,
    }
}

async fn route_frame(
    registry: &ConnectionRegistry,
    id: SessionId,
    payload: &[u8],
) -> Result<(), RouteError> {
    match registry.route_client_message(id, payload).await {
        // Relay-side failures are not the sender's fault.
        Err(RouteError::Broadcast(err)) => {
            warn!(session = id, %err, "failed to relay message");
            Ok(())
        }
        other => other,
    }
}

fn close_with_policy_violation(outbox: &mpsc::Sender<Outbound>, reason: &str) {
    if let Err(err) = outbox.try_send(Outbound::Close {
        reason: reason.to_owned(),
    }) {
        debug!(%err, "could not queue close frame");
    }
}

async fn forward_outbox(
    mut sink: WsSink,
    mut outbox: mpsc::Receiver<Outbound>,
    peer: SocketAddr,
) {
    while let Some(outbound) = outbox.recv().await {
        let message = match outbound {
            Outbound::Frame(frame) => Message::Text(frame),
            Outbound::Close { reason } => {
                let close = CloseFrame {
                    code: CloseCode::Policy,
                    reason: reason.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(close))).await {
                    debug!(%peer, error = ?err, "failed to send close frame");
                }
                break;
            }
        };

        if let Err(err) = sink.send(message).await {
            debug!(%peer, error = ?err, "failed to deliver frame");
            break;
        }
    }
    // Dropping the receiver here makes later deliveries to this peer fail,
    // which removes it from the registry.
}

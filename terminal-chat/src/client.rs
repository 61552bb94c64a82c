use std::{future::Future, io::BufReader, ops::RangeInclusive, time::Duration};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::header::InvalidHeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    config::ClientConfig,
    event::{self, CodecError, Event},
    headers::CredentialHeaders,
    input::{spawn_line_reader, LineSlot},
    security::{Security, SecurityError},
};

pub const USERNAME_PREFIX: &str = "user_";

/// How long to watch a fresh connection for an immediate close.
const HANDSHAKE_GRACE_MS: RangeInclusive<u64> = 150..=400;
/// Pause between polls of the outgoing slot and between received frames.
const POLL_INTERVAL_MS: RangeInclusive<u64> = 5..=50;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("server rejected the connection: {reason}")]
    Rejected { reason: String },

    #[error("invalid credential header: {0}")]
    Header(#[from] InvalidHeaderValue),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

/// A connection that survived server-side validation.
pub struct Connection {
    sink: WsSink,
    source: WsSource,
    /// A frame that arrived while the connection was being confirmed.
    pending: Option<Message>,
}

pub struct ClientSession {
    config: ClientConfig,
    security: Security,
    username: String,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let security = Security::new(&config.key, config.rounds);
        let username = config.username.clone().unwrap_or_else(generate_username);
        Self {
            config,
            security,
            username,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Opens the connection with encrypted credentials and confirms the
    /// server did not close it straight away.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let url = self.config.url.clone();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|source| ClientError::Connect {
                url: url.clone(),
                source,
            })?;
        let headers = CredentialHeaders::seal(
            &self.security,
            &self.config.password,
            Some(self.username.as_str()),
        )?;
        headers.apply(request.headers_mut())?;

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|source| ClientError::Connect { url, source })?;
        let (sink, mut source) = ws.split();

        // The server accepts the upgrade before it checks credentials and
        // closes right after on rejection.
        let pending = match timeout(jitter(HANDSHAKE_GRACE_MS), source.next()).await {
            Err(_still_open) => None,
            Ok(Some(Ok(Message::Close(frame)))) => {
                let reason = frame
                    .map(|frame| frame.reason.into_owned())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "connection closed by server".to_string());
                return Err(ClientError::Rejected { reason });
            }
            Ok(Some(Ok(message))) => Some(message),
            Ok(Some(Err(err))) => {
                return Err(ClientError::Rejected {
                    reason: err.to_string(),
                })
            }
            Ok(None) => {
                return Err(ClientError::Rejected {
                    reason: "connection closed by server".to_string(),
                })
            }
        };

        Ok(Connection {
            sink,
            source,
            pending,
        })
    }

    /// Connects, then sends lines from `slot` and renders incoming events to
    /// `out` until the connection ends.
    pub async fn run<W>(self, slot: &LineSlot, out: &mut W) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        self.run_until(slot, out, std::future::pending::<()>()).await
    }

    /// Like [`ClientSession::run`], but also stops when `shutdown` resolves.
    /// Stopping before the connection is confirmed prints nothing.
    pub async fn run_until<W, F>(
        self,
        slot: &LineSlot,
        out: &mut W,
        shutdown: F,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let connection = select! {
            result = self.connect() => result?,
            _ = &mut shutdown => {
                debug!(url = %self.config.url, "stopped before the connection was confirmed");
                return Ok(());
            }
        };
        let Connection {
            mut sink,
            mut source,
            pending,
        } = connection;

        info!(url = %self.config.url, username = %self.username, "connected");
        write_line(
            out,
            &format!("*** connected to {} as {}", self.config.url, self.username),
        )
        .await?;

        let mut open = true;
        if let Some(message) = pending {
            open = self.handle_frame(message, out).await?;
        }

        if open {
            select! {
                result = self.send_loop(&mut sink, slot) => result?,
                result = self.receive_loop(&mut source, out) => result?,
                _ = &mut shutdown => debug!("stopping on request"),
            }
        }

        if let Err(err) = sink.close().await {
            debug!(error = ?err, "failed to close connection cleanly");
        }
        write_line(out, &format!("*** disconnected from {}", self.config.url)).await?;
        Ok(())
    }

    async fn send_loop(&self, sink: &mut WsSink, slot: &LineSlot) -> Result<(), ClientError> {
        loop {
            if let Some(line) = slot.take() {
                let encoded = event::encode(&Event::message(self.username.as_str(), line))?;
                let frame = self.security.encrypt_to_string(encoded)?;
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    debug!(error = ?err, "send failed");
                    return Ok(());
                }
            }
            sleep(jitter(POLL_INTERVAL_MS)).await;
        }
    }

    async fn receive_loop<W>(&self, source: &mut WsSource, out: &mut W) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(message) => {
                    if !self.handle_frame(message, out).await? {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = ?err, "receive failed");
                    break;
                }
            }
            sleep(jitter(POLL_INTERVAL_MS)).await;
        }
        Ok(())
    }

    /// Returns false once the server has closed the connection.
    async fn handle_frame<W>(&self, message: Message, out: &mut W) -> Result<bool, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    debug!(code = ?frame.code, reason = %frame.reason, "server closed connection");
                }
                return Ok(false);
            }
            _ => return Ok(true),
        };

        let event = match self.open(&payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "ignoring unreadable frame from server");
                return Ok(true);
            }
        };
        match event {
            Event::Message { from, .. } if from == self.username => {}
            Event::Message { from, body } => write_line(out, &format!("<{from}> {body}")).await?,
            Event::Users { count } => {
                write_line(out, &format!("*** users connected: {count}")).await?
            }
        }
        Ok(true)
    }

    fn open(&self, payload: &[u8]) -> Result<Event, ClientError> {
        let plaintext = self.security.decrypt(payload)?;
        Ok(event::decode(&plaintext)?)
    }
}

/// Runs the terminal client: stdin feeds the outgoing slot on its own
/// thread, stdout shows the conversation.
pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::try_from(args)?;
    let session = ClientSession::new(config);
    let url = session.url().to_string();

    let slot = LineSlot::new();
    spawn_line_reader(BufReader::new(std::io::stdin()), slot.clone())?;

    let mut stdout = tokio::io::stdout();
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };
    match session.run_until(&slot, &mut stdout, shutdown).await {
        Err(ClientError::Rejected { reason }) => {
            write_stderr(&format!("!!! connection rejected: {reason}")).await?;
            anyhow::bail!("connection to {url} was rejected");
        }
        other => other?,
    }

    Ok(())
}

fn generate_username() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{USERNAME_PREFIX}{suffix:04}")
}

fn jitter(range_ms: RangeInclusive<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(range_ms))
}

async fn write_line<W>(out: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

async fn write_stderr(line: &str) -> std::io::Result<()> {
    write_line(&mut tokio::io::stderr(), line).await
}

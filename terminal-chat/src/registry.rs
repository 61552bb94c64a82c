//! Authoritative membership of the relay and fan-out of events.
//!
//! Every mutation of the active session set and the claimed usernames goes
//! through [`ConnectionRegistry::register`] and
//! [`ConnectionRegistry::unregister`], both serialized by one mutex. A
//! broadcast holds the same mutex for its whole fan-out, so membership
//! cannot change between delivering an event to the first and the last
//! member.
//!
//! Each member's outbox holds at most [`OUTBOX_CAPACITY`] frames. A member
//! whose outbox is full or closed is dropped from the registry, and its
//! connection learns of it through [`SessionHandle::membership`].

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    event::{self, CodecError, Event},
    headers::CredentialHeaders,
    security::{Security, SecurityError},
};

pub type SessionId = u64;

/// Frames a member may have waiting before it counts as unresponsive.
pub const OUTBOX_CAPACITY: usize = 128;

/// Creates the bounded queue between the registry and a connection's writer.
pub fn outbox() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
    mpsc::channel(OUTBOX_CAPACITY)
}

/// What a connection's writer task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encrypted frame to deliver as-is.
    Frame(String),
    /// Close the connection with a policy-violation status.
    Close { reason: String },
}

/// The registry's view of one connection.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    remote_addr: SocketAddr,
    connected_at: Instant,
    outbox: mpsc::Sender<Outbound>,
    membership: watch::Sender<()>,
}

impl SessionHandle {
    pub fn new(id: SessionId, remote_addr: SocketAddr, outbox: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: Instant::now(),
            outbox,
            membership: watch::Sender::new(()),
        }
    }

    /// `changed()` on the returned receiver fails once the registry no
    /// longer holds this session.
    pub fn membership(&self) -> watch::Receiver<()> {
        self.membership.subscribe()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: SessionId,
    pub username: Option<String>,
}

/// A member that has just been removed from the registry.
#[derive(Debug, Clone)]
pub struct Departure {
    pub id: SessionId,
    pub username: Option<String>,
    pub remote_addr: SocketAddr,
    pub connected_for: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid authorization header")]
    AuthenticationFailure,

    #[error("username '{0}' is already registered")]
    DuplicateIdentity(String),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("frame could not be decrypted: {0}")]
    AuthenticationFailure(#[from] SecurityError),

    #[error(transparent)]
    DecodeFailure(#[from] CodecError),

    #[error("clients may only send message events")]
    UnexpectedEvent,

    #[error("failed to broadcast message: {0}")]
    Broadcast(#[from] BroadcastError),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

pub struct ConnectionRegistry {
    security: Security,
    password: String,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Member>,
    usernames: HashSet<String>,
}

struct Member {
    username: Option<String>,
    remote_addr: SocketAddr,
    connected_at: Instant,
    outbox: mpsc::Sender<Outbound>,
    _membership: watch::Sender<()>,
}

impl Member {
    fn departure(self, id: SessionId) -> Departure {
        Departure {
            id,
            username: self.username,
            remote_addr: self.remote_addr,
            connected_for: self.connected_at.elapsed(),
        }
    }
}

impl ConnectionRegistry {
    pub fn new(security: Security, password: impl Into<String>) -> Self {
        Self {
            security,
            password: password.into(),
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// True only when the authorization header decrypts to exactly the
    /// configured password.
    pub fn authenticate(&self, headers: &CredentialHeaders) -> bool {
        let Some(authorization) = &headers.authorization else {
            return false;
        };
        match self.security.decrypt(authorization) {
            Ok(password) => password == self.password.as_bytes(),
            Err(err) => {
                debug!(%err, "authorization header rejected");
                false
            }
        }
    }

    /// Absent, empty, undecryptable, or non-UTF-8 usernames all mean the
    /// connection is anonymous.
    pub fn extract_username(&self, headers: &CredentialHeaders) -> Option<String> {
        let ciphertext = headers.username.as_deref()?;
        let plaintext = self.security.decrypt(ciphertext).ok()?;
        String::from_utf8(plaintext)
            .ok()
            .filter(|username| !username.is_empty())
    }

    /// Admits `session` if its credentials are valid and its username is
    /// free, then tells every member (the new one included) the new count.
    pub async fn register(
        &self,
        session: SessionHandle,
        headers: &CredentialHeaders,
    ) -> Result<Registration, RegisterError> {
        if !self.authenticate(headers) {
            return Err(RegisterError::AuthenticationFailure);
        }
        let username = self.extract_username(headers);

        let mut state = self.state.lock().await;
        if let Some(name) = &username {
            if !state.usernames.insert(name.clone()) {
                return Err(RegisterError::DuplicateIdentity(name.clone()));
            }
        }
        state.sessions.insert(
            session.id,
            Member {
                username: username.clone(),
                remote_addr: session.remote_addr,
                connected_at: session.connected_at,
                outbox: session.outbox,
                _membership: session.membership,
            },
        );
        info!(
            peer = %session.remote_addr,
            username = username.as_deref().unwrap_or("anonymous"),
            users = state.sessions.len(),
            "client connected"
        );

        if let Err(err) = self.announce_count(&mut state) {
            warn!(%err, "failed to announce user count");
        }

        Ok(Registration {
            id: session.id,
            username,
        })
    }

    /// Removes the session and announces the new count. Removing a session
    /// that is not registered is a no-op.
    pub async fn unregister(&self, id: SessionId) -> Option<Departure> {
        let mut state = self.state.lock().await;
        let departure = state.remove(id)?;
        log_departure(&departure);

        if let Err(err) = self.announce_count(&mut state) {
            warn!(%err, "failed to announce user count");
        }
        Some(departure)
    }

    /// Encrypts `event` once and delivers it to every active session.
    /// Returns how many members received it.
    pub async fn broadcast(&self, event: &Event) -> Result<usize, BroadcastError> {
        let mut state = self.state.lock().await;
        let frame = self.seal(event)?;
        let delivered = self.deliver(&mut state, &frame)?;
        Ok(delivered)
    }

    /// Decrypts a frame from `id`, checks it is a message event, and relays
    /// it to everyone. The `from` field is relayed exactly as the sender
    /// wrote it.
    pub async fn route_client_message(
        &self,
        id: SessionId,
        ciphertext: &[u8],
    ) -> Result<(), RouteError> {
        let plaintext = self.security.decrypt(ciphertext)?;
        let event = event::decode(&plaintext)?;
        let Event::Message { .. } = &event else {
            return Err(RouteError::UnexpectedEvent);
        };

        let delivered = self.broadcast(&event).await?;
        debug!(session = id, delivered, "relayed message");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn username_count(&self) -> usize {
        self.state.lock().await.usernames.len()
    }

    fn seal(&self, event: &Event) -> Result<String, BroadcastError> {
        let encoded = event::encode(event)?;
        Ok(self.security.encrypt_to_string(encoded)?)
    }

    fn announce_count(&self, state: &mut RegistryState) -> Result<usize, BroadcastError> {
        let frame = self.seal(&Event::users(state.sessions.len()))?;
        self.deliver(state, &frame)
    }

    /// Fans `frame` out to every member. Members whose outbox is full or
    /// closed are dropped afterwards and the remaining members get the corrected count,
    /// repeating until a round of deliveries has no failures.
    fn deliver(&self, state: &mut RegistryState, frame: &str) -> Result<usize, BroadcastError> {
        let mut delivered = 0;
        let mut failed = state.fan_out(frame, &mut delivered);

        while !failed.is_empty() {
            for id in failed {
                if let Some(departure) = state.remove(id) {
                    debug!(session = id, "delivery failed, dropping member");
                    log_departure(&departure);
                }
            }
            let count_frame = self.seal(&Event::users(state.sessions.len()))?;
            let mut ignored = 0;
            failed = state.fan_out(&count_frame, &mut ignored);
        }

        Ok(delivered)
    }
}

impl RegistryState {
    fn fan_out(&self, frame: &str, delivered: &mut usize) -> Vec<SessionId> {
        let mut failed = Vec::new();
        for (id, member) in &self.sessions {
            match member.outbox.try_send(Outbound::Frame(frame.to_owned())) {
                Ok(()) => *delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = id, peer = %member.remote_addr, "outbox full, evicting member");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }
        failed
    }

    fn remove(&mut self, id: SessionId) -> Option<Departure> {
        let member = self.sessions.remove(&id)?;
        if let Some(username) = &member.username {
            self.usernames.remove(username);
        }
        Some(member.departure(id))
    }
}

fn log_departure(departure: &Departure) {
    info!(
        peer = %departure.remote_addr,
        username = departure.username.as_deref().unwrap_or("anonymous"),
        connected_secs = departure.connected_for.as_secs(),
        "client disconnected"
    );
}

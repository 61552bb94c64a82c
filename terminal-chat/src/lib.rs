//! Encrypted terminal chat over WebSockets.
//!
//! One relay process authenticates clients with a shared password and
//! rebroadcasts their messages to everyone connected. Headers and frames are
//! protected by layered symmetric encryption under a key the relay prints at
//! startup.
//!
//! - [`cli`] parses the `server` and `client` subcommands.
//! - [`config`] validates arguments into [`config::ServerConfig`] and
//!   [`config::ClientConfig`].
//! - [`security`] applies and reverses the encryption rounds.
//! - [`event`] is the JSON event codec used inside the encryption.
//! - [`headers`] carries the encrypted credentials of a new connection.
//! - [`registry`] owns membership, username uniqueness, and fan-out.
//! - [`server`] accepts connections and drives each session.
//! - [`client`] connects, sends typed lines, and renders incoming events.
//! - [`input`] reads typed lines on a background thread.

pub mod cli;
pub mod client;
pub mod config;
pub mod event;
pub mod headers;
pub mod input;
pub mod registry;
pub mod security;
pub mod server;

use clap::{Args, Parser, Subcommand};

use crate::security::Rounds;

#[derive(Parser, Debug)]
#[command(author, version, about = "Encrypted terminal chat over WebSockets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay that authenticates clients and broadcasts their messages.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = 430)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Password clients must present in their authorization header.
    #[arg(long, default_value = "top_secret")]
    pub password: String,

    /// Encryption rounds applied to every header and message (1-5).
    #[arg(
        short,
        long,
        alias = "cryptography-digest-count",
        default_value_t = Rounds::default().get(),
        value_parser = clap::value_parser!(u8).range(1..=5)
    )]
    pub rounds: u8,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Key printed by the server at startup.
    pub cryptography_key: String,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://localhost:430/")]
    pub url: String,

    /// Display name. A `user_NNNN` name is generated when omitted.
    #[arg(long, default_value = "")]
    pub username: String,

    /// Password for the authorization header.
    #[arg(long, default_value = "top_secret")]
    pub password: String,

    /// Encryption rounds; must match the server (1-5).
    #[arg(
        short,
        long,
        alias = "cryptography-digest-count",
        default_value_t = Rounds::default().get(),
        value_parser = clap::value_parser!(u8).range(1..=5)
    )]
    pub rounds: u8,
}

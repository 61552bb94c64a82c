//! Validated settings built from command-line arguments before any core
//! component is constructed.

use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::{
    cli::{ClientArgs, ServerArgs},
    security::{Rounds, SecurityError, SessionKey},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "round count must be between {min} and {max}, got {0}",
        min = Rounds::MIN,
        max = Rounds::MAX
    )]
    Rounds(u8),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error(transparent)]
    Key(#[from] SecurityError),

    #[error("invalid server url '{url}': {reason}")]
    Url { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub rounds: Rounds,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            host: args.host,
            port: args.port,
            password: validate_password(args.password)?,
            rounds: validate_rounds(args.rounds)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub key: SessionKey,
    pub password: String,
    pub rounds: Rounds,
    /// `None` lets the client pick its own name.
    pub username: Option<String>,
}

impl TryFrom<ClientArgs> for ClientConfig {
    type Error = ConfigError;

    fn try_from(args: ClientArgs) -> Result<Self, Self::Error> {
        if let Err(err) = args.url.as_str().into_client_request() {
            return Err(ConfigError::Url {
                url: args.url,
                reason: err.to_string(),
            });
        }

        let username = args.username.trim();
        Ok(Self {
            key: SessionKey::parse(&args.cryptography_key)?,
            password: validate_password(args.password)?,
            rounds: validate_rounds(args.rounds)?,
            username: (!username.is_empty()).then(|| username.to_string()),
            url: args.url,
        })
    }
}

fn validate_password(password: String) -> Result<String, ConfigError> {
    if password.is_empty() {
        return Err(ConfigError::EmptyPassword);
    }
    Ok(password)
}

fn validate_rounds(rounds: u8) -> Result<Rounds, ConfigError> {
    Rounds::try_from(rounds).map_err(ConfigError::Rounds)
}

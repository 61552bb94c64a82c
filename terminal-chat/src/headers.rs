use tokio_tungstenite::tungstenite::http::{
    header::{HeaderName, InvalidHeaderValue, AUTHORIZATION},
    HeaderMap, HeaderValue,
};

use crate::security::{Security, SecurityError};

pub const USERNAME: &str = "username";

/// Credential headers attached when a client opens its connection.
///
/// Both values are ciphertext. `None` means the header was not sent at all;
/// `Some("")` means it was sent empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialHeaders {
    pub authorization: Option<String>,
    pub username: Option<String>,
}

impl CredentialHeaders {
    /// Encrypts the password and optional username for a new connection.
    pub fn seal(
        security: &Security,
        password: &str,
        username: Option<&str>,
    ) -> Result<Self, SecurityError> {
        let username = username
            .map(|name| security.encrypt_to_string(name))
            .transpose()?;
        Ok(Self {
            authorization: Some(security.encrypt_to_string(password)?),
            username,
        })
    }

    /// Non-UTF-8 header values are treated as absent.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            authorization: read(AUTHORIZATION.as_str()),
            username: read(USERNAME),
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), InvalidHeaderValue> {
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization)?);
        }
        if let Some(username) = &self.username {
            headers.insert(
                HeaderName::from_static(USERNAME),
                HeaderValue::from_str(username)?,
            );
        }
        Ok(())
    }
}

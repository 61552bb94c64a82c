//! Layered symmetric encryption shared by the relay and its clients.
//!
//! One [`SessionKey`] is generated by the server at startup and copied to
//! every client out-of-band. Payloads are sealed [`Rounds`] times in a row:
//! each round produces a URL-safe base64 token of `nonce || ciphertext`, and
//! that token is the plaintext of the next round. The final output is plain
//! ASCII, so it can travel in an HTTP header or a WebSocket text frame.
//!
//! Every round authenticates its own index and the total round count as
//! associated data, which makes a round-count mismatch between peers fail
//! authentication instead of surfacing an inner token as plaintext.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const AAD_DOMAIN: &[u8] = b"terminal-chat/round";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    /// Some round failed its integrity check. Covers tampering, a different
    /// key, and a different round count.
    #[error("ciphertext failed authentication at round {round}")]
    AuthenticationFailure { round: u8 },

    #[error("invalid cryptography key: {0}")]
    InvalidKey(String),

    #[error("encryption failed at round {round}")]
    Encryption { round: u8 },
}

/// Number of sequential encryption passes, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rounds(u8);

impl Rounds {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Rounds {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u8> for Rounds {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(value)
        }
    }
}

impl fmt::Display for Rounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pre-shared 256-bit key. Its textual form is URL-safe base64.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn parse(encoded: &str) -> Result<Self, SecurityError> {
        let bytes = URL_SAFE
            .decode(encoded.trim())
            .map_err(|err| SecurityError::InvalidKey(err.to_string()))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SecurityError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.0)
    }
}

// Keep key material out of logs.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Applies and reverses the layered encryption for one session key and
/// round count.
#[derive(Clone)]
pub struct Security {
    cipher: ChaCha20Poly1305,
    rounds: Rounds,
}

impl Security {
    pub fn new(key: &SessionKey, rounds: Rounds) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
            rounds,
        }
    }

    pub fn rounds(&self) -> Rounds {
        self.rounds
    }

    /// Seals `plaintext` once per round; the output of each round feeds the
    /// next.
    pub fn encrypt(&self, plaintext: impl AsRef<[u8]>) -> Result<Vec<u8>, SecurityError> {
        let mut current = plaintext.as_ref().to_vec();
        for round in 1..=self.rounds.get() {
            current = self.seal_round(&current, round)?;
        }
        Ok(current)
    }

    /// Opens the rounds in reverse order. Fails as a whole if any round
    /// does not authenticate.
    pub fn decrypt(&self, ciphertext: impl AsRef<[u8]>) -> Result<Vec<u8>, SecurityError> {
        let mut current = ciphertext.as_ref().to_vec();
        for round in (1..=self.rounds.get()).rev() {
            current = self.open_round(&current, round)?;
        }
        Ok(current)
    }

    /// Convenience for header values and text frames.
    pub fn encrypt_to_string(&self, plaintext: impl AsRef<[u8]>) -> Result<String, SecurityError> {
        let sealed = self.encrypt(plaintext)?;
        // Every round ends in base64, so this never fails.
        String::from_utf8(sealed).map_err(|_| SecurityError::Encryption {
            round: self.rounds.get(),
        })
    }

    fn seal_round(&self, input: &[u8], round: u8) -> Result<Vec<u8>, SecurityError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let aad = self.associated_data(round);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: input,
                    aad: &aad,
                },
            )
            .map_err(|_| SecurityError::Encryption { round })?;

        let mut token = Vec::with_capacity(NONCE_SIZE + sealed.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&sealed);
        Ok(URL_SAFE.encode(token).into_bytes())
    }

    fn open_round(&self, input: &[u8], round: u8) -> Result<Vec<u8>, SecurityError> {
        let failure = SecurityError::AuthenticationFailure { round };

        let token = URL_SAFE.decode(input).map_err(|_| failure.clone())?;
        if token.len() < NONCE_SIZE + TAG_SIZE {
            return Err(failure);
        }
        let (nonce_bytes, sealed) = token.split_at(NONCE_SIZE);

        let aad = self.associated_data(round);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| failure)
    }

    fn associated_data(&self, round: u8) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + 2);
        aad.extend_from_slice(AAD_DOMAIN);
        aad.push(round);
        aad.push(self.rounds.get());
        aad
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security")
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

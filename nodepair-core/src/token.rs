use anyhow::{Context, Result, ensure};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the random secret carried by every generated token.
pub const SECRET_LEN: usize = 32;

/// Everything a channel layer needs to find and enter one rendezvous
/// channel.
///
/// Serialized as JSON and wrapped in URL-safe base64 so the resulting
/// token survives QR codes, copy/paste and command lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    /// Hex-encoded random secret. Two tokens never share one.
    pub secret: String,
    /// Optional `host:port` of a relay hosting the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous: Option<String>,
}

impl ConnectionData {
    /// Draws a fresh secret from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self {
            secret: hex::encode(secret),
            rendezvous: None,
        }
    }

    /// Pins the relay the channel should be joined through.
    #[must_use]
    pub fn with_rendezvous(mut self, addr: impl Into<String>) -> Self {
        self.rendezvous = Some(addr.into());
        self
    }

    /// Encodes into the printable token form.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing two strings into JSON cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Parses a token produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not base64, not JSON, or carries a
    /// secret of the wrong size.
    pub fn decode(token: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .context("token is not valid base64")?;
        let data: Self = serde_json::from_slice(&raw).context("token is not valid connection data")?;
        let secret = hex::decode(&data.secret).context("token secret is not hex")?;
        ensure!(
            secret.len() == SECRET_LEN,
            "token secret has {} bytes, expected {SECRET_LEN}",
            secret.len()
        );
        Ok(data)
    }
}

/// Returns a fresh token suitable for a single pairing.
#[must_use]
pub fn generate_token() -> String {
    ConnectionData::generate().encode()
}

/// Returns a random identity for one participant of one channel.
#[must_use]
pub fn generate_peer_id() -> String {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}

/// Derives the channel identifier a relay knows a token by.
///
/// Structured tokens hash their secret so the rendezvous address can change
/// without moving the channel; any other string is hashed as-is.
#[must_use]
pub fn room_id(token: &str) -> String {
    let material = match ConnectionData::decode(token) {
        Ok(data) => data.secret,
        Err(_) => token.to_owned(),
    };
    hex::encode(Sha256::digest(material.as_bytes()))
}

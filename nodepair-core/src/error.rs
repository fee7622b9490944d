use thiserror::Error;

/// Errors returned by the `send` and `receive` pairing calls.
///
/// Configuration and join failures are fatal and reported before any
/// waiting starts. Everything that happens inside the wait loops is
/// transient and retried on the next poll; the only way out of a wait
/// is success or cancellation.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The token was empty after every option and the token reader ran.
    #[error(
        "no token supplied or couldn't read one from the configured reader (try a better image or input source)"
    )]
    MissingToken,

    /// A configuration option rejected its input.
    #[error("invalid pairing option: {0:#}")]
    ConfigOption(anyhow::Error),

    /// The channel layer could not join the rendezvous channel.
    #[error("failed to join pairing channel: {0:#}")]
    ChannelJoin(anyhow::Error),

    /// The channel refused an entry outright, such as a payload too large
    /// for the relay to carry. Reported before any waiting starts.
    #[error("failed to publish on the pairing channel: {0:#}")]
    Announce(anyhow::Error),

    /// The payload could not be encoded, or the received payload did not
    /// fit the destination.
    #[error("pairing payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The call was cancelled and the configuration asked for cancellation
    /// to be reported as an error.
    #[error("pairing cancelled before the handshake completed")]
    Cancelled,
}

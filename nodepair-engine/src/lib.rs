//! # nodepair-engine
//!
//! Runtime logic for nodepair, embedded into the CLI and usable as a
//! library.
//!
//! This crate provides:
//! - **Pairing state machines**: [`pairing::send`] and [`pairing::receive`],
//!   cancellable and generic over the channel (`ChannelFactory` trait)
//! - **Quorum detection** shared by both roles
//! - **Channel implementations**: in-memory ([`memory`]) and relay-backed
//!   ([`relay_channel`]) over TCP
//! - **Relay server**: a command/event driven loop hosting rooms of
//!   replicated entries for relay channels

/// Logs a protocol progress message at a level chosen at runtime.
macro_rules! progress {
    ($level:expr, $($arg:tt)+) => {{
        let level: ::tracing::Level = $level;
        if level == ::tracing::Level::ERROR {
            ::tracing::error!($($arg)+);
        } else if level == ::tracing::Level::WARN {
            ::tracing::warn!($($arg)+);
        } else if level == ::tracing::Level::INFO {
            ::tracing::info!($($arg)+);
        } else if level == ::tracing::Level::DEBUG {
            ::tracing::debug!($($arg)+);
        } else {
            ::tracing::trace!($($arg)+);
        }
    }};
}

pub mod memory;
pub mod message_processor;
pub mod pairing;
pub mod quorum;
pub mod relay;
pub mod relay_channel;
pub mod rooms;
pub mod session;
pub mod tcp;

pub use pairing::{PairingOutcome, receive, send};

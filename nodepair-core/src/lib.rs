//! # nodepair-core
//!
//! Shared building blocks for nodepair, a token-based pairing protocol
//! that moves one payload between two processes over an
//! eventually-consistent key-value channel.
//!
//! This crate provides the types used by `nodepair-engine` and the
//! `nodepair` binary.
//!
//! ## Responsibilities
//!
//! - **Tokens**: generation, the self-describing connection data behind a
//!   token, and room id derivation.
//!
//! - **Pairing configuration**: ordered options, token readers, polling
//!   intervals and the cancellation policy.
//!
//! - **Channel model**: the [`channel::Channel`] / [`channel::ChannelFactory`]
//!   seam the protocol runs against, and the [`ledger::Ledger`] replica every
//!   channel implementation stores entries in.
//!
//! - **Relay wire protocol**: frame format (magic / version / type / length)
//!   and JSON payloads, plus the transport traits relays and relay clients
//!   are generic over.

pub mod channel;
pub mod config;
pub mod error;
pub mod ledger;
pub mod listener;
pub mod protocol;
pub mod token;

pub use config::{
    CancelPolicy, PairConfig, PairOption, PollIntervals, TokenReader, with_cancel_policy,
    with_intervals, with_liveness_window, with_log_level, with_reader, with_token,
};
pub use error::PairingError;
pub use token::{generate_peer_id, generate_token};

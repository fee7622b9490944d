use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodepair_core::config::DEFAULT_LIVENESS_WINDOW;
use nodepair_core::listener::{Connection, Listener, ListenerFactory};

use crate::rooms::Rooms;
use crate::session::{RelaySession, SessionHandler};

// ── Relay commands (CLI → relay) ────────────────────────────────────

/// Commands sent by the CLI to control the relay.
#[derive(Clone, Debug)]
pub enum RelayCmd {
    /// Bind a listener on `addr` and start accepting clients.
    StartAccepting { addr: String },
    /// Stop accepting new clients (drop the listener). Connected clients
    /// keep being served.
    StopAccepting,
    /// Disconnect every client and stop the relay.
    ShutDown,
}

// ── Relay events (relay → CLI) ──────────────────────────────────────

/// Events emitted by the relay for the CLI to observe.
#[derive(Clone, Debug)]
pub enum RelayEvent {
    /// The listener is bound and accepting clients on `addr`.
    Accepting { addr: String },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A client entered `room` under the identity `peer`.
    PeerJoined { room: String, peer: String },
    /// A client that had joined `room` disconnected.
    PeerLeft { room: String, peer: String },
    /// A non-fatal error occurred inside the relay.
    Error { message: String },
}

// ── Relay handle ────────────────────────────────────────────────────

/// Handle returned by [`Relay::start`]. Lets the caller send commands
/// and subscribe to events.
pub struct RelayHandle {
    pub cmd_tx: mpsc::Sender<RelayCmd>,
    pub events_tx: broadcast::Sender<RelayEvent>,
}

// ── Relay ───────────────────────────────────────────────────────────

/// Configuration of a relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// How long an entry nobody re-announces is kept. Matches the pairing
    /// liveness window by default, so the relay never forgets a participant
    /// the protocol still counts as live.
    pub retention: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_LIVENESS_WINDOW,
        }
    }
}

/// The rendezvous relay.
///
/// Hosts rooms of replicated entries for relay channels: every client of a
/// room receives every announce made in it. The relay never interprets
/// entries, so it knows nothing about pairing itself.
///
/// Generic over `F: ListenerFactory`, so tests and production differ only
/// in the factory they pass.
pub struct Relay;

impl Relay {
    /// Spawn the relay event loop and return a handle to control it.
    ///
    /// The relay starts idle: no listener is active until a
    /// [`RelayCmd::StartAccepting`] arrives.
    pub fn start<F: ListenerFactory>(self, factory: F, config: RelayConfig) -> RelayHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<RelayCmd>(32);
        let (events_tx, _) = broadcast::channel::<RelayEvent>(128);

        info!(retention = ?config.retention, "Spawning relay event loop");
        tokio::spawn(run_relay_loop(factory, config, cmd_rx, events_tx.clone()));

        RelayHandle { cmd_tx, events_tx }
    }
}

/// The main relay event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Relay` itself.
async fn run_relay_loop<F: ListenerFactory>(
    factory: F,
    config: RelayConfig,
    mut cmd_rx: mpsc::Receiver<RelayCmd>,
    events: broadcast::Sender<RelayEvent>,
) {
    debug!("Relay event loop running");

    let rooms = Rooms::new(config.retention);
    let sessions = CancellationToken::new();
    let mut listener: Option<F::L> = None;

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RelayCmd::StartAccepting { addr }) => {
                        info!(addr = %addr, "Received StartAccepting command");
                        match factory.bind(&addr).await {
                            Ok(l) => {
                                let bound_addr = l.local_addr();
                                listener = Some(l);
                                let _ = events.send(RelayEvent::Accepting { addr: bound_addr });
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to bind listener");
                                let _ = events.send(RelayEvent::Error {
                                    message: format!("{e:#}"),
                                });
                            }
                        }
                    }

                    Some(RelayCmd::StopAccepting) => {
                        info!("Received StopAccepting command");
                        listener = None;
                        let _ = events.send(RelayEvent::AcceptingStopped);
                    }

                    Some(RelayCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }

                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Accept inbound connections ───────────────────────
            result = async {
                if let Some(l) = listener.as_mut() {
                    l.accept().await
                } else {
                    std::future::pending().await
                }
            }, if listener.is_some() => {
                match result {
                    Ok(conn) => {
                        info!(peer = %Connection::peer(&conn), "Client connected");
                        let handler = RelaySession::new(
                            rooms.clone(),
                            events.clone(),
                            sessions.child_token(),
                        );
                        tokio::spawn(async move { handler.handle(conn).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        let _ = events.send(RelayEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
        }
    }

    sessions.cancel();
    info!("Relay event loop stopped");
}

// ── Tests ───────────────────────────────────────────────────────────

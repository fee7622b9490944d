use bytes::BytesMut;
use tokio::select;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodepair_core::listener::Connection;
use nodepair_core::protocol::{
    EntryPayload, ErrorPayload, MessageType, encode_payload_frame, try_decode_frame,
};

use crate::message_processor::{Reply, SessionState, process_frame};
use crate::relay::RelayEvent;
use crate::rooms::Rooms;

/// Trait for handling accepted connections.
///
/// The relay calls [`handle`](SessionHandler::handle) for every inbound
/// connection, each in its own spawned task.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, conn: C) -> impl Future<Output = ()> + Send;
}

/// Serves one relay client: a `Join`, then any number of `Announce`s,
/// while forwarding the room's updates back as `Update` frames.
pub struct RelaySession {
    rooms: Rooms,
    events: broadcast::Sender<RelayEvent>,
    cancel: CancellationToken,
}

impl RelaySession {
    #[must_use]
    pub fn new(
        rooms: Rooms,
        events: broadcast::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rooms,
            events,
            cancel,
        }
    }

    async fn serve<C: Connection>(
        &self,
        conn: &mut C,
        peer: &str,
        state: &mut SessionState,
    ) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        let mut accum = BytesMut::with_capacity(8192);
        let mut updates: Option<broadcast::Receiver<EntryPayload>> = None;

        loop {
            select! {
                biased;

                () = self.cancel.cancelled() => {
                    info!(peer = %peer, "Session cancelled");
                    return Ok(());
                }

                update = async {
                    match updates.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                }, if updates.is_some() => match update {
                    Ok(entry) => {
                        let frame = encode_payload_frame(MessageType::Update, &entry)?;
                        conn.write_all(&frame).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(peer = %peer, skipped, "Session lagging, updates skipped");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },

                res = conn.read(&mut buf) => {
                    let n = res?;
                    if n == 0 {
                        info!(peer = %peer, "Connection closed by peer");
                        return Ok(());
                    }
                    accum.extend_from_slice(&buf[..n]);

                    // Drain all complete frames; a partial one stays in accum.
                    while let Some(frame) = try_decode_frame(&mut accum)? {
                        match process_frame(peer, &self.rooms, state, &frame)? {
                            Reply::Nothing => {}
                            Reply::Joined { ack, updates: rx } => {
                                conn.write_all(&ack).await?;
                                updates = Some(rx);
                                if let Some(joined) = state.joined.as_ref() {
                                    let _ = self.events.send(RelayEvent::PeerJoined {
                                        room: joined.room.clone(),
                                        peer: joined.peer_id.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<C: Connection> SessionHandler<C> for RelaySession {
    async fn handle(&self, mut conn: C) {
        let peer = conn.peer();
        info!(peer = %peer, "Session started");

        let mut state = SessionState::default();
        if let Err(e) = self.serve(&mut conn, &peer, &mut state).await {
            warn!(peer = %peer, error = %e, "Session error, closing connection");
            let report = ErrorPayload {
                code: "protocol".into(),
                message: format!("{e:#}"),
            };
            if let Ok(frame) = encode_payload_frame(MessageType::Error, &report) {
                let _ = conn.write_all(&frame).await;
            }
        }

        if let Some(joined) = state.joined.take() {
            self.rooms.leave(&joined.room);
            let _ = self.events.send(RelayEvent::PeerLeft {
                room: joined.room,
                peer: joined.peer_id,
            });
        }
        let _ = conn.shutdown().await;
        debug!(peer = %peer, "Session finished");
    }
}

use anyhow::{bail, ensure};
use bytes::BytesMut;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use nodepair_core::protocol::{
    EntryPayload, ErrorPayload, Frame, JoinPayload, MAX_ENTRY_LEN, MessageType, decode_payload,
    encode_join_ack,
};

use crate::rooms::Rooms;

/// The room a session has entered, and under which identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub room: String,
    pub peer_id: String,
}

/// Per-connection protocol state.
#[derive(Debug, Default)]
pub struct SessionState {
    pub joined: Option<Joined>,
}

/// What the session must do after a frame was processed.
#[derive(Debug)]
pub enum Reply {
    /// Nothing to send back.
    Nothing,
    /// The session entered a room: send `ack` (one or more `JoinAck`
    /// frames), then forward `updates`.
    Joined {
        ack: BytesMut,
        updates: broadcast::Receiver<EntryPayload>,
    },
}

/// Processes a fully decoded frame by dispatching to the appropriate handler
/// based on the message type.
///
/// Returns `Err(..)` if the session should be torn down (protocol error).
pub fn process_frame(
    peer: &str,
    rooms: &Rooms,
    state: &mut SessionState,
    frame: &Frame,
) -> anyhow::Result<Reply> {
    debug!(
        peer = %peer,
        msg_type = ?frame.header.msg_type,
        payload_len = frame.header.payload_length,
        "Processing frame"
    );

    match frame.header.msg_type {
        MessageType::Join => handle_join(peer, rooms, state, &frame.payload),
        MessageType::Announce => handle_announce(peer, rooms, state, &frame.payload),
        MessageType::Error => handle_error(peer, &frame.payload),
        other => bail!("unexpected {other:?} frame from a client"),
    }
}

fn handle_join(
    peer: &str,
    rooms: &Rooms,
    state: &mut SessionState,
    payload: &[u8],
) -> anyhow::Result<Reply> {
    ensure!(state.joined.is_none(), "already joined a room");

    let join: JoinPayload = decode_payload(payload)?;
    ensure!(!join.room.is_empty(), "room must not be empty");
    ensure!(!join.peer_id.is_empty(), "peer id must not be empty");

    let membership = rooms.join(&join.room);
    debug!(
        peer = %peer,
        room = %join.room,
        entries = membership.snapshot.len(),
        "Joined room"
    );
    let ack = encode_join_ack(membership.snapshot);
    state.joined = Some(Joined {
        room: join.room,
        peer_id: join.peer_id,
    });

    Ok(Reply::Joined {
        ack: ack?,
        updates: membership.updates,
    })
}

fn handle_announce(
    peer: &str,
    rooms: &Rooms,
    state: &SessionState,
    payload: &[u8],
) -> anyhow::Result<Reply> {
    let Some(joined) = state.joined.as_ref() else {
        bail!("announce before join");
    };
    ensure!(
        payload.len() <= MAX_ENTRY_LEN,
        "entry too large: {} bytes (max {MAX_ENTRY_LEN})",
        payload.len()
    );

    let entry: EntryPayload = decode_payload(payload)?;
    debug!(
        peer = %peer,
        room = %joined.room,
        namespace = %entry.namespace,
        key = %entry.key,
        "Announce"
    );
    ensure!(rooms.announce(&joined.room, entry), "room {} is gone", joined.room);
    Ok(Reply::Nothing)
}

fn handle_error(peer: &str, payload: &[u8]) -> anyhow::Result<Reply> {
    match decode_payload::<ErrorPayload>(payload) {
        Ok(err) => warn!(peer = %peer, code = %err.code, message = %err.message, "Client reported error"),
        Err(_) => warn!(peer = %peer, "Received malformed ERROR frame"),
    }
    bail!("client reported an error")
}

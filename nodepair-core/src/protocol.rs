use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ASCII magic bytes that open every relay frame.
const MAGIC: &[u8; 5] = b"NPAIR";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload.
const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
/// Upper bound on one encoded entry. The headroom below
/// [`MAX_PAYLOAD_LEN`] keeps every stored entry small enough for a
/// `JoinAck` frame once its age is attached.
pub const MAX_ENTRY_LEN: usize = MAX_PAYLOAD_LEN - 1024;
/// Room left in a `JoinAck` frame for the wrapper around its entries.
const JOIN_ACK_OVERHEAD: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Relay message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client → relay: enter a room.
    Join = 0x01,
    /// Relay → client: room entered, here is its current state.
    JoinAck = 0x02,
    /// Client → relay: publish one entry.
    Announce = 0x10,
    /// Relay → client: an entry was published in the room.
    Update = 0x11,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Join),
            0x02 => Ok(Self::JoinAck),
            0x10 => Ok(Self::Announce),
            0x11 => Ok(Self::Update),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags, `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))`: a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.
/// * `Err(..)`: protocol violation. The caller should close the connection.
///
/// # Errors
///
/// Returns an error on bad magic, unsupported version, unknown message
/// type, or a payload exceeding the frame size limit.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected NPAIR"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]);
    let payload_len = u32::from_be_bytes([
        buf[OFF_LENGTH],
        buf[OFF_LENGTH + 1],
        buf[OFF_LENGTH + 2],
        buf[OFF_LENGTH + 3],
    ]) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Appends one frame (header + `payload`) to `buf`.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // callers stay below MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::Join`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// Room id derived from the pairing token.
    pub room: String,
    /// Identity the client will announce under.
    pub peer_id: String,
}

/// One entry of a room, as carried by [`MessageType::JoinAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    /// How long ago the relay last saw this entry announced.
    pub age_ms: u64,
}

/// Payload for [`MessageType::JoinAck`].
///
/// A room larger than one frame is sent as several consecutive `JoinAck`
/// frames; all but the last have `more` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAckPayload {
    pub entries: Vec<RoomEntry>,
    #[serde(default)]
    pub more: bool,
}

/// Payload for [`MessageType::Announce`] and [`MessageType::Update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPayload {
    pub namespace: String,
    pub key: String,
    pub value: Value,
}

/// Payload for [`MessageType::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Encodes a serializable payload into a frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails or the encoded payload is
/// larger than a frame may carry.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    ensure!(
        json.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Encodes `entry` as an `Announce` or `Update` frame.
///
/// # Errors
///
/// Returns an error if the encoded entry is larger than [`MAX_ENTRY_LEN`].
pub fn encode_entry_frame(msg_type: MessageType, entry: &EntryPayload) -> Result<BytesMut> {
    let json = serde_json::to_vec(entry)?;
    ensure!(
        json.len() <= MAX_ENTRY_LEN,
        "entry {}/{} too large: {} bytes (max {MAX_ENTRY_LEN})",
        entry.namespace,
        entry.key,
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Encodes a room snapshot as one or more consecutive `JoinAck` frames in a
/// single buffer. An empty room still gets one frame.
///
/// # Errors
///
/// Returns an error if a single entry cannot fit a frame on its own.
pub fn encode_join_ack(entries: Vec<RoomEntry>) -> Result<BytesMut> {
    let budget = MAX_PAYLOAD_LEN - JOIN_ACK_OVERHEAD;
    let mut chunks: Vec<Vec<RoomEntry>> = vec![Vec::new()];
    let mut used = 0;

    for entry in entries {
        // +1 for the separating comma.
        let len = serde_json::to_vec(&entry)?.len() + 1;
        ensure!(
            len <= budget,
            "entry {}/{} too large for a join ack: {len} bytes",
            entry.namespace,
            entry.key
        );
        if used + len > budget {
            chunks.push(Vec::new());
            used = 0;
        }
        used += len;
        if let Some(chunk) = chunks.last_mut() {
            chunk.push(entry);
        }
    }

    let last = chunks.len() - 1;
    let mut buf = BytesMut::new();
    for (i, entries) in chunks.into_iter().enumerate() {
        let frame = encode_payload_frame(
            MessageType::JoinAck,
            &JoinAckPayload {
                entries,
                more: i < last,
            },
        )?;
        buf.extend_from_slice(&frame);
    }
    Ok(buf)
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

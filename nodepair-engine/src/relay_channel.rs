use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use nodepair_core::channel::{Channel, ChannelFactory};
use nodepair_core::ledger::{Entry, Ledger};
use nodepair_core::listener::{Connection, Connector};
use nodepair_core::protocol::{
    EntryPayload, ErrorPayload, Frame, JoinAckPayload, JoinPayload, MessageType, RoomEntry,
    decode_payload, encode_entry_frame, encode_payload_frame, try_decode_frame,
};
use nodepair_core::token::{ConnectionData, room_id};
use nodepair_core::generate_peer_id;

/// How long the relay gets to acknowledge a join.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Announce frames queued for the relay before announcers wait.
const OUTBOUND_BACKLOG: usize = 64;

/// Joins channels hosted by a relay.
///
/// The relay address comes from the token when it names one, otherwise
/// from the factory's default.
pub struct RelayChannelFactory<K> {
    connector: Arc<K>,
    default_relay: Option<String>,
}

impl<K> Clone for RelayChannelFactory<K> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            default_relay: self.default_relay.clone(),
        }
    }
}

impl<K: Connector> RelayChannelFactory<K> {
    #[must_use]
    pub fn new(connector: K) -> Self {
        Self {
            connector: Arc::new(connector),
            default_relay: None,
        }
    }

    /// Relay used for tokens that do not name one.
    #[must_use]
    pub fn with_default_relay(mut self, addr: impl Into<String>) -> Self {
        self.default_relay = Some(addr.into());
        self
    }

    fn relay_for(&self, token: &str) -> anyhow::Result<String> {
        ConnectionData::decode(token)
            .ok()
            .and_then(|data| data.rendezvous)
            .or_else(|| self.default_relay.clone())
            .ok_or_else(|| anyhow!("token names no relay and no default relay is configured"))
    }

    /// Connects, joins the token's room and reads the room state.
    async fn handshake(&self, token: &str) -> anyhow::Result<Joined<K::Conn>> {
        let addr = self.relay_for(token)?;
        let room = room_id(token);
        let identity = generate_peer_id();

        let mut conn = self.connector.connect(&addr).await?;
        let join = encode_payload_frame(
            MessageType::Join,
            &JoinPayload {
                room: room.clone(),
                peer_id: identity.clone(),
            },
        )?;
        conn.write_all(&join).await?;

        let mut accum = BytesMut::with_capacity(8192);
        let entries = read_join_ack(&mut conn, &mut accum).await?;

        // Ages are relative to the relay's clock; re-anchor them on ours.
        let now = Instant::now();
        let mut ledger = Ledger::new();
        for entry in entries {
            let Some(seen) = now.checked_sub(Duration::from_millis(entry.age_ms)) else {
                continue;
            };
            ledger.upsert(&entry.namespace, &entry.key, entry.value, seen);
        }
        info!(relay = %addr, room = %room, peer = %identity, "Joined relay room");

        Ok(Joined {
            conn,
            accum,
            identity,
            ledger,
        })
    }
}

/// A freshly joined room, before replication starts.
struct Joined<C> {
    conn: C,
    accum: BytesMut,
    identity: String,
    ledger: Ledger,
}

impl<K: Connector> ChannelFactory for RelayChannelFactory<K> {
    type Channel = RelayChannel;

    fn join<'a>(
        &'a self,
        token: &'a str,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a {
        async move {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => bail!("join cancelled"),
                res = timeout(JOIN_TIMEOUT, self.handshake(token)) => {
                    res.context("timed out waiting for the relay")??
                }
            };

            let ledger = Arc::new(Mutex::new(joined.ledger));
            let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BACKLOG);
            tokio::spawn(replicate(
                joined.conn,
                joined.accum,
                Arc::clone(&ledger),
                outbound_rx,
                cancel,
            ));

            Ok(RelayChannel {
                identity: joined.identity,
                ledger,
                outbound: outbound_tx,
            })
        }
    }
}

/// A channel replicated through a relay.
///
/// Announces go to the relay, which echoes them back to every member of the
/// room, this one included. The local replica only changes from what the
/// relay sends, so an entry seen locally is known to have reached the
/// relay.
pub struct RelayChannel {
    identity: String,
    ledger: Arc<Mutex<Ledger>>,
    outbound: mpsc::Sender<BytesMut>,
}

impl Channel for RelayChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn announce_repeating(
        &self,
        cancel: CancellationToken,
        interval: Duration,
        namespace: &str,
        key: &str,
        value: Value,
    ) -> anyhow::Result<()> {
        let entry = EntryPayload {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value,
        };
        let frame = encode_entry_frame(MessageType::Announce, &entry)?;

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = outbound.send(frame.clone()) => {
                        if sent.is_err() {
                            debug!(key = %entry.key, "Relay connection gone, announce stopped");
                            return;
                        }
                    }
                }
                trace!(namespace = %entry.namespace, key = %entry.key, "Announced");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = sleep(interval) => {}
                }
            }
            trace!(namespace = %entry.namespace, key = %entry.key, "Announce stopped");
        });
        Ok(())
    }

    fn get_key(&self, namespace: &str, key: &str) -> Option<Value> {
        self.ledger
            .lock()
            .get(namespace, key)
            .map(|entry| entry.value.clone())
    }

    fn snapshot(&self, namespace: &str) -> BTreeMap<String, Entry> {
        self.ledger.lock().snapshot(namespace)
    }
}

/// Reads until one whole frame is buffered in `accum`.
async fn read_frame<C: Connection>(conn: &mut C, accum: &mut BytesMut) -> anyhow::Result<Frame> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = try_decode_frame(accum)? {
            return Ok(frame);
        }
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            bail!("relay closed the connection");
        }
        accum.extend_from_slice(&buf[..n]);
    }
}

/// Reads the relay's answer to a join: one or more `JoinAck` frames holding
/// the room's entries.
async fn read_join_ack<C: Connection>(
    conn: &mut C,
    accum: &mut BytesMut,
) -> anyhow::Result<Vec<RoomEntry>> {
    let mut entries = Vec::new();
    loop {
        let reply = read_frame(conn, accum).await?;
        let ack: JoinAckPayload = match reply.header.msg_type {
            MessageType::JoinAck => decode_payload(&reply.payload)?,
            MessageType::Error => {
                let err: ErrorPayload = decode_payload(&reply.payload)?;
                bail!("relay refused the join: {}", err.message);
            }
            other => bail!("unexpected {other:?} frame while joining"),
        };
        entries.extend(ack.entries);
        if !ack.more {
            return Ok(entries);
        }
    }
}

/// Applies every complete frame in `accum` to the replica.
fn apply_frames(accum: &mut BytesMut, ledger: &Mutex<Ledger>) -> anyhow::Result<()> {
    while let Some(frame) = try_decode_frame(accum)? {
        match frame.header.msg_type {
            MessageType::Update => {
                let entry: EntryPayload = decode_payload(&frame.payload)?;
                ledger
                    .lock()
                    .upsert(&entry.namespace, &entry.key, entry.value, Instant::now());
            }
            MessageType::Error => {
                let err: ErrorPayload = decode_payload(&frame.payload)?;
                bail!("relay reported {}: {}", err.code, err.message);
            }
            other => bail!("unexpected {other:?} frame from relay"),
        }
    }
    Ok(())
}

/// Moves announces to the relay and updates into the replica until `cancel`
/// fires, every announcer is gone or the relay hangs up.
async fn replicate<C: Connection>(
    mut conn: C,
    mut accum: BytesMut,
    ledger: Arc<Mutex<Ledger>>,
    mut outbound: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) {
    let relay = conn.peer();
    let mut buf = [0u8; 4096];

    let result: anyhow::Result<()> = async {
        apply_frames(&mut accum, &ledger)?;
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Ok(()),

                frame = outbound.recv() => match frame {
                    Some(frame) => conn.write_all(&frame).await?,
                    None => return Ok(()),
                },

                res = conn.read(&mut buf) => {
                    let n = res?;
                    if n == 0 {
                        bail!("relay closed the connection");
                    }
                    accum.extend_from_slice(&buf[..n]);
                    apply_frames(&mut accum, &ledger)?;
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => debug!(relay = %relay, "Replication stopped"),
        Err(e) => warn!(relay = %relay, error = %e, "Replication failed"),
    }
    let _ = conn.shutdown().await;
}

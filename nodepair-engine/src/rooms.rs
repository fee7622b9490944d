use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use nodepair_core::ledger::Ledger;
use nodepair_core::protocol::{EntryPayload, RoomEntry};

/// Pending updates a slow member may lag behind before it starts missing
/// some. Entries are re-announced, so a lagging member catches up anyway.
const UPDATE_BACKLOG: usize = 256;

/// One room: the relay's replica of its entries plus the fan-out of new
/// announces to every member.
struct Room {
    ledger: Ledger,
    updates: broadcast::Sender<EntryPayload>,
    members: usize,
}

impl Room {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BACKLOG);
        Self {
            ledger: Ledger::new(),
            updates,
            members: 0,
        }
    }
}

/// What a session gets back when it enters a room.
pub struct Membership {
    /// The room's entries at join time, with their ages.
    pub snapshot: Vec<RoomEntry>,
    /// Every announce made in the room from the moment of joining on.
    pub updates: broadcast::Receiver<EntryPayload>,
}

/// All rooms hosted by a relay, shared between its sessions.
///
/// A room exists while it has at least one member; its entries are dropped
/// with it.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<Mutex<HashMap<String, Room>>>,
    retention: Duration,
}

impl Rooms {
    /// Rooms whose entries are forgotten once older than `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    /// Enters `room`, creating it if needed.
    ///
    /// Expired entries are pruned first. The snapshot and the subscription
    /// are taken under the same lock, so no announce falls between them.
    pub fn join(&self, room: &str) -> Membership {
        let now = Instant::now();
        let mut rooms = self.inner.lock();
        let state = rooms.entry(room.to_owned()).or_insert_with(Room::new);

        let pruned = state.ledger.prune(now, self.retention);
        if pruned > 0 {
            debug!(room = %room, pruned, "Pruned expired entries");
        }
        state.members += 1;

        let snapshot = state
            .ledger
            .entries()
            .map(|(namespace, key, entry)| RoomEntry {
                namespace: namespace.to_owned(),
                key: key.to_owned(),
                value: entry.value.clone(),
                age_ms: u64::try_from(entry.age(now).as_millis()).unwrap_or(u64::MAX),
            })
            .collect();

        Membership {
            snapshot,
            updates: state.updates.subscribe(),
        }
    }

    /// Records an announce in `room` and fans it out to every member.
    ///
    /// Returns `false` if the room does not exist (nobody is in it).
    pub fn announce(&self, room: &str, entry: EntryPayload) -> bool {
        let mut rooms = self.inner.lock();
        let Some(state) = rooms.get_mut(room) else {
            return false;
        };
        state
            .ledger
            .upsert(&entry.namespace, &entry.key, entry.value.clone(), Instant::now());
        // No receivers is fine: every member may be mid-teardown.
        let _ = state.updates.send(entry);
        true
    }

    /// Leaves `room`; the last member out drops it.
    pub fn leave(&self, room: &str) {
        let mut rooms = self.inner.lock();
        let Some(state) = rooms.get_mut(room) else {
            return;
        };
        state.members = state.members.saturating_sub(1);
        if state.members == 0 {
            rooms.remove(room);
            debug!(room = %room, "Room closed");
        }
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.lock().len()
    }
}

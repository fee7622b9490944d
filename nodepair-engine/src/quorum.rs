use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use nodepair_core::channel::{Channel, PRESENCE};
use nodepair_core::ledger::Entry;

/// Live participants needed before a handshake may proceed.
pub const QUORUM: usize = 2;

/// Identities whose presence was refreshed within `window` of `now`,
/// in key order.
#[must_use]
pub fn live_participants(
    presence: &BTreeMap<String, Entry>,
    now: Instant,
    window: Duration,
) -> Vec<String> {
    presence
        .iter()
        .filter(|(_, entry)| entry.age(now) <= window)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Polls the `presence` namespace every `interval` until at least
/// [`QUORUM`] live participants are visible.
///
/// Returns the live identities seen at that moment. The list is a snapshot:
/// any of them may be gone by the time the caller acts on it. Returns `None`
/// once `cancel` fires.
pub async fn wait_for_quorum<C: Channel>(
    channel: &C,
    interval: Duration,
    window: Duration,
    cancel: &CancellationToken,
    level: Level,
) -> Option<Vec<String>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let live = live_participants(&channel.snapshot(PRESENCE), Instant::now(), window);
        if live.len() >= QUORUM {
            progress!(level, participants = live.len(), "Quorum reached");
            return Some(live);
        }
        progress!(level, participants = live.len(), "Not enough participants yet");

        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = sleep(interval) => {}
        }
    }
}

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ledger::Entry;

/// Namespace where participants advertise that they are alive.
pub const PRESENCE: &str = "presence";
/// Namespace holding the payload and the per-participant acknowledgments.
pub const PAIRING: &str = "pairing";
/// Key of the payload inside [`PAIRING`].
pub const DATA_KEY: &str = "data";

/// A joined session on a shared, eventually-consistent key-value store.
///
/// Implementations give no delivery guarantee beyond "eventually visible":
/// announces may arrive late, out of order or more than once. Reads are
/// local and may be stale. Nothing here blocks on the network, so the
/// pairing protocol only ever waits by polling.
pub trait Channel: Send + Sync + 'static {
    /// This participant's identity on the channel.
    fn identity(&self) -> &str;

    /// Publishes `namespace/key = value` now and again every `interval`
    /// until `cancel` fires. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error, and announces nothing, if the entry can never be
    /// published on this channel (for instance because it is too large).
    fn announce_repeating(
        &self,
        cancel: CancellationToken,
        interval: Duration,
        namespace: &str,
        key: &str,
        value: Value,
    ) -> anyhow::Result<()>;

    /// Reads one key from the local replica.
    fn get_key(&self, namespace: &str, key: &str) -> Option<Value>;

    /// Copies every key of `namespace` known to the local replica.
    fn snapshot(&self, namespace: &str) -> BTreeMap<String, Entry>;
}

/// Joins rendezvous channels by token.
///
/// Injected into the pairing calls so tests can swap the network stack
/// for an in-memory one.
pub trait ChannelFactory: Send + Sync + 'static {
    /// The concrete channel type produced by [`join`](ChannelFactory::join).
    type Channel: Channel;

    /// Joins the channel `token` grants access to and starts replicating it
    /// in the background. Replication stops once `cancel` fires.
    fn join<'a>(
        &'a self,
        token: &'a str,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a;
}

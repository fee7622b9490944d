use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use nodepair_core::channel::{Channel, ChannelFactory};
use nodepair_core::generate_peer_id;
use nodepair_core::ledger::{Entry, Ledger};

/// A process-local stand-in for the replicated store.
///
/// Every token maps to one shared [`Ledger`]; channels joined with the same
/// token see each other's announces as soon as they are written. Useful for
/// tests and for pairing two tasks of the same process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    rooms: Arc<Mutex<HashMap<String, Arc<Mutex<Ledger>>>>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The ledger shared by every channel joined with `token`.
    #[must_use]
    pub fn room(&self, token: &str) -> Arc<Mutex<Ledger>> {
        Arc::clone(self.rooms.lock().entry(token.to_owned()).or_default())
    }

    /// A factory joining channels on this network.
    #[must_use]
    pub fn factory(&self) -> MemoryChannelFactory {
        MemoryChannelFactory {
            network: self.clone(),
            joins: Arc::new(AtomicUsize::new(0)),
            fail_joins: false,
        }
    }
}

/// Joins [`MemoryChannel`]s and counts how often it was asked to.
#[derive(Clone)]
pub struct MemoryChannelFactory {
    network: MemoryNetwork,
    joins: Arc<AtomicUsize>,
    fail_joins: bool,
}

impl MemoryChannelFactory {
    /// Makes every subsequent join fail, as an unreachable network would.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_joins = true;
        self
    }

    /// Number of join attempts so far, failed ones included.
    #[must_use]
    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }
}

impl ChannelFactory for MemoryChannelFactory {
    type Channel = MemoryChannel;

    fn join<'a>(
        &'a self,
        token: &'a str,
        _cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a {
        async move {
            self.joins.fetch_add(1, Ordering::SeqCst);
            if self.fail_joins {
                bail!("memory network is unreachable");
            }
            let channel = MemoryChannel {
                identity: generate_peer_id(),
                ledger: self.network.room(token),
            };
            debug!(peer = %channel.identity, "Joined memory channel");
            Ok(channel)
        }
    }
}

/// A channel whose replica is the shared room ledger itself.
pub struct MemoryChannel {
    identity: String,
    ledger: Arc<Mutex<Ledger>>,
}

impl Channel for MemoryChannel {
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
        let ledger = Arc::clone(&self.ledger);
        let namespace = namespace.to_owned();
        let key = key.to_owned();
        tokio::spawn(async move {
            loop {
                ledger
                    .lock()
                    .upsert(&namespace, &key, value.clone(), Instant::now());
                trace!(namespace = %namespace, key = %key, "Announced");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = sleep(interval) => {}
                }
            }
            trace!(namespace = %namespace, key = %key, "Announce stopped");
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

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    async fn join(factory: &MemoryChannelFactory, token: &str) -> MemoryChannel {
        factory.join(token, CancellationToken::new()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn when_announced_expect_visible_to_other_channel_of_same_token() {
        let factory = MemoryNetwork::new().factory();
        let a = join(&factory, "tok").await;
        let b = join(&factory, "tok").await;
        let cancel = CancellationToken::new();

        a.announce_repeating(cancel.clone(), Duration::from_secs(1), "pairing", "data", json!(7)).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(b.get_key("pairing", "data"), Some(json!(7)));
        assert_ne!(a.identity(), b.identity());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn when_tokens_differ_expect_isolated_rooms() {
        let factory = MemoryNetwork::new().factory();
        let a = join(&factory, "one").await;
        let b = join(&factory, "two").await;
        let cancel = CancellationToken::new();

        a.announce_repeating(cancel.clone(), Duration::from_secs(1), "presence", "a", json!("")).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(b.snapshot("presence").is_empty());
        assert_eq!(a.snapshot("presence").len(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn when_announce_repeats_expect_last_seen_refreshed() {
        let factory = MemoryNetwork::new().factory();
        let a = join(&factory, "tok").await;
        let cancel = CancellationToken::new();

        a.announce_repeating(cancel.clone(), Duration::from_secs(2), "presence", "a", json!("")).unwrap();
        sleep(Duration::from_millis(10)).await;
        let first = a.snapshot("presence")["a"].last_seen;

        sleep(Duration::from_secs(5)).await;
        let later = a.snapshot("presence")["a"].last_seen;

        assert!(later > first);
        assert_eq!(a.snapshot("presence").len(), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn when_cancelled_expect_announces_stop() {
        let factory = MemoryNetwork::new().factory();
        let a = join(&factory, "tok").await;
        let cancel = CancellationToken::new();

        a.announce_repeating(cancel.clone(), Duration::from_secs(1), "presence", "a", json!("")).unwrap();
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        sleep(Duration::from_millis(10)).await;
        let frozen = a.snapshot("presence")["a"].last_seen;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(a.snapshot("presence")["a"].last_seen, frozen);
    }

    #[tokio::test]
    async fn when_joining_expect_join_count_incremented() {
        let factory = MemoryNetwork::new().factory();
        assert_eq!(factory.join_count(), 0);
        let _a = join(&factory, "tok").await;
        let _b = join(&factory, "tok").await;
        assert_eq!(factory.join_count(), 2);
    }

    #[tokio::test]
    async fn when_factory_failing_expect_join_error_still_counted() {
        let factory = MemoryNetwork::new().factory().failing();
        let result = factory.join("tok", CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(factory.join_count(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Announcing the same entry any number of times leaves exactly one
        /// entry holding that value.
        #[test]
        fn given_same_entry_announced_repeatedly_then_one_entry_with_that_value(
            repeats in 1usize..16,
            value in any::<i64>(),
        ) {
            let (entries, seen) = paused_runtime().block_on(async {
                let factory = MemoryNetwork::new().factory();
                let a = join(&factory, "tok").await;
                let b = join(&factory, "tok").await;
                let cancel = CancellationToken::new();

                for _ in 0..repeats {
                    a.announce_repeating(cancel.clone(), Duration::from_secs(1), "pairing", "data", json!(value))
                        .unwrap();
                    sleep(Duration::from_millis(300)).await;
                }
                cancel.cancel();
                (b.snapshot("pairing").len(), b.get_key("pairing", "data"))
            });

            prop_assert_eq!(entries, 1);
            prop_assert_eq!(seen, Some(json!(value)));
        }
    }
}

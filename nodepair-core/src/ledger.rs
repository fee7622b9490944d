use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// One key of a namespace as last seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// When this key was last announced, as observed by this replica.
    pub last_seen: Instant,
}

impl Entry {
    /// Time elapsed since the entry was last refreshed, as of `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// A namespaced key-value replica.
///
/// Nothing is ever deleted by an announce: writes only overwrite the value
/// and refresh `last_seen`. Readers decide what "current" means by
/// filtering on age; [`prune`](Self::prune) drops entries nobody refreshed.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    namespaces: HashMap<String, BTreeMap<String, Entry>>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `namespace/key` as seen at `seen_at`.
    ///
    /// Re-announcing an identical value only moves `last_seen` forward;
    /// an older `seen_at` never rolls it back.
    pub fn upsert(&mut self, namespace: &str, key: &str, value: Value, seen_at: Instant) {
        let entries = self.namespaces.entry(namespace.to_owned()).or_default();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.last_seen = entry.last_seen.max(seen_at);
            }
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value,
                        last_seen: seen_at,
                    },
                );
            }
        }
    }

    #[must_use]
    pub fn get(&self, namespace: &str, key: &str) -> Option<&Entry> {
        self.namespaces.get(namespace)?.get(key)
    }

    /// A point-in-time copy of one namespace, ordered by key.
    #[must_use]
    pub fn snapshot(&self, namespace: &str) -> BTreeMap<String, Entry> {
        self.namespaces.get(namespace).cloned().unwrap_or_default()
    }

    /// Every `(namespace, key, entry)` triple, for full-state transfers.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Entry)> {
        self.namespaces.iter().flat_map(|(ns, keys)| {
            keys.iter()
                .map(move |(key, entry)| (ns.as_str(), key.as_str(), entry))
        })
    }

    /// Removes entries not refreshed within `max_age` of `now`.
    ///
    /// Returns how many entries were dropped.
    pub fn prune(&mut self, now: Instant, max_age: Duration) -> usize {
        let mut dropped = 0;
        self.namespaces.retain(|_, keys| {
            let before = keys.len();
            keys.retain(|_, entry| entry.age(now) <= max_age);
            dropped += before - keys.len();
            !keys.is_empty()
        });
        dropped
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn given_repeated_identical_announces_when_read_then_same_as_single_announce() {
        let t0 = Instant::now();
        let mut once = Ledger::new();
        once.upsert("pairing", "data", json!({"foo": "Bar"}), t0);

        let mut many = Ledger::new();
        for _ in 0..50 {
            many.upsert("pairing", "data", json!({"foo": "Bar"}), t0);
        }

        assert_eq!(once.get("pairing", "data"), many.get("pairing", "data"));
        assert_eq!(many.snapshot("pairing").len(), 1);
    }

    #[test]
    fn given_stale_write_when_upserted_then_last_seen_not_rolled_back() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(5);
        let mut ledger = Ledger::new();
        ledger.upsert("presence", "a", json!(""), later);
        ledger.upsert("presence", "a", json!(""), t0);
        assert_eq!(ledger.get("presence", "a").unwrap().last_seen, later);
    }

    #[test]
    fn given_new_value_when_upserted_then_value_replaced() {
        let t0 = Instant::now();
        let mut ledger = Ledger::new();
        ledger.upsert("pairing", "data", json!(1), t0);
        ledger.upsert("pairing", "data", json!(2), t0);
        assert_eq!(ledger.get("pairing", "data").unwrap().value, json!(2));
    }

    #[test]
    fn given_unknown_namespace_when_snapshotted_then_empty() {
        let ledger = Ledger::new();
        assert!(ledger.snapshot("presence").is_empty());
        assert!(ledger.get("presence", "a").is_none());
    }

    #[test]
    fn given_keys_when_snapshotted_then_ordered_by_key() {
        let t0 = Instant::now();
        let mut ledger = Ledger::new();
        for key in ["charlie", "alice", "bob"] {
            ledger.upsert("presence", key, json!(""), t0);
        }
        let keys: Vec<_> = ledger.snapshot("presence").into_keys().collect();
        assert_eq!(keys, ["alice", "bob", "charlie"]);
    }

    #[test]
    fn given_old_and_fresh_entries_when_pruned_then_only_fresh_remain() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(100);
        let mut ledger = Ledger::new();
        ledger.upsert("presence", "old", json!(""), t0);
        ledger.upsert("presence", "fresh", json!(""), now);
        ledger.upsert("pairing", "gone", json!(""), t0);

        assert_eq!(ledger.prune(now, Duration::from_secs(10)), 2);
        assert!(ledger.get("presence", "fresh").is_some());
        assert!(ledger.get("presence", "old").is_none());
        assert!(ledger.snapshot("pairing").is_empty());
    }

    #[test]
    fn given_entries_in_two_namespaces_when_iterated_then_all_listed() {
        let t0 = Instant::now();
        let mut ledger = Ledger::new();
        ledger.upsert("presence", "a", json!(""), t0);
        ledger.upsert("pairing", "data", json!(42), t0);
        let mut triples: Vec<_> = ledger.entries().map(|(ns, k, _)| (ns, k)).collect();
        triples.sort_unstable();
        assert_eq!(triples, [("pairing", "data"), ("presence", "a")]);
    }
}

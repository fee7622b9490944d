//! The two pairing roles.
//!
//! Both roles are short linear state machines over a [`Channel`]. Every
//! wait polls the channel and sleeps between polls, racing the sleep
//! against the call's cancel token, so cancellation is observed within
//! one polling interval. Background announces started by a call are bound
//! to a child of the caller's token that is cancelled when the call
//! returns, whatever the outcome.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nodepair_core::channel::{Channel, ChannelFactory, DATA_KEY, PAIRING, PRESENCE};
use nodepair_core::{CancelPolicy, PairConfig, PairOption, PairingError};

use crate::quorum::{QUORUM, wait_for_quorum};

/// Value published under `pairing/<identity>` to acknowledge the payload.
const ACK_VALUE: &str = "ok";

/// How a pairing call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The handshake completed: the payload moved and the ack was seen.
    Paired,
    /// The cancel token fired first. Nothing is known about the peer.
    Cancelled,
}

impl PairingOutcome {
    #[must_use]
    pub fn is_paired(self) -> bool {
        self == Self::Paired
    }
}

/// Receives one payload into `destination`.
///
/// Joins the channel named by the configured token, announces presence,
/// waits for a peer, decodes the first `pairing/data` it sees, publishes an
/// acknowledgment and waits until that acknowledgment is visible in its
/// own replica before returning.
///
/// # Errors
///
/// - [`PairingError::MissingToken`] / [`PairingError::ConfigOption`] before
///   any channel activity.
/// - [`PairingError::ChannelJoin`] if the channel cannot be joined.
/// - [`PairingError::Announce`] if the channel refuses an announce.
/// - [`PairingError::Payload`] if the payload does not fit `destination`;
///   the acknowledgment is still published so the sender is released.
/// - [`PairingError::Cancelled`] on cancellation under [`CancelPolicy::Fail`].
pub async fn receive<F, T, I>(
    factory: &F,
    cancel: &CancellationToken,
    destination: &mut T,
    options: I,
) -> Result<PairingOutcome, PairingError>
where
    F: ChannelFactory,
    T: DeserializeOwned,
    I: IntoIterator<Item = PairOption>,
{
    let config = PairConfig::apply(options)?;
    let level = config.log_level;

    let scope = cancel.child_token();
    let _scope_guard = scope.clone().drop_guard();

    let channel = match factory.join(&config.token, scope.clone()).await {
        Ok(channel) => channel,
        Err(_) if scope.is_cancelled() => return cancelled(&config),
        Err(e) => return Err(PairingError::ChannelJoin(e)),
    };
    let me = channel.identity().to_owned();
    progress!(level, peer = %me, "Joined pairing channel as receiver");

    channel
        .announce_repeating(
            scope.clone(),
            config.intervals.announce,
            PRESENCE,
            &me,
            Value::String(String::new()),
        )
        .map_err(PairingError::Announce)?;

    let quorum = wait_for_quorum(
        &channel,
        config.intervals.quorum,
        config.liveness_window,
        &scope,
        level,
    )
    .await;
    if quorum.is_none() {
        return cancelled(&config);
    }

    let decoded = loop {
        if let Some(value) = channel.get_key(PAIRING, DATA_KEY) {
            progress!(level, peer = %me, "Payload received, acknowledging");
            let decoded = serde_json::from_value(value).map(|payload| *destination = payload);
            channel
                .announce_repeating(
                    scope.clone(),
                    config.intervals.announce,
                    PAIRING,
                    &me,
                    Value::String(ACK_VALUE.to_owned()),
                )
                .map_err(PairingError::Announce)?;
            break decoded;
        }
        if !pause(&scope, config.intervals.payload).await {
            return cancelled(&config);
        }
    };

    while channel.get_key(PAIRING, &me).is_none() {
        if !pause(&scope, config.intervals.ack).await {
            return cancelled(&config);
        }
    }

    decoded?;
    info!(peer = %me, "Pairing complete, payload received");
    Ok(PairingOutcome::Paired)
}

/// Sends `payload` to the peer holding the same token.
///
/// Publishes the payload and its own presence, waits for a peer, then polls
/// the peers visible at quorum time for an acknowledgment. The first
/// acknowledgment found completes the handshake: pairing is a two-party
/// affair and extra participants on the same token are only warned about.
///
/// # Errors
///
/// - [`PairingError::MissingToken`] / [`PairingError::ConfigOption`] before
///   any channel activity.
/// - [`PairingError::Payload`] if `payload` cannot be serialized.
/// - [`PairingError::ChannelJoin`] if the channel cannot be joined.
/// - [`PairingError::Announce`] if the channel refuses the payload, for
///   instance because it is too large to carry. No waiting happens first.
/// - [`PairingError::Cancelled`] on cancellation under [`CancelPolicy::Fail`].
pub async fn send<F, T, I>(
    factory: &F,
    cancel: &CancellationToken,
    payload: &T,
    options: I,
) -> Result<PairingOutcome, PairingError>
where
    F: ChannelFactory,
    T: Serialize + ?Sized,
    I: IntoIterator<Item = PairOption>,
{
    let config = PairConfig::apply(options)?;
    let level = config.log_level;
    let payload = serde_json::to_value(payload)?;

    let scope = cancel.child_token();
    let _scope_guard = scope.clone().drop_guard();

    let channel = match factory.join(&config.token, scope.clone()).await {
        Ok(channel) => channel,
        Err(_) if scope.is_cancelled() => return cancelled(&config),
        Err(e) => return Err(PairingError::ChannelJoin(e)),
    };
    let me = channel.identity().to_owned();
    progress!(level, peer = %me, "Joined pairing channel as sender");

    channel
        .announce_repeating(
            scope.clone(),
            config.intervals.announce,
            PAIRING,
            DATA_KEY,
            payload,
        )
        .map_err(PairingError::Announce)?;
    channel
        .announce_repeating(
            scope.clone(),
            config.intervals.announce,
            PRESENCE,
            &me,
            Value::String(String::new()),
        )
        .map_err(PairingError::Announce)?;

    let Some(active) = wait_for_quorum(
        &channel,
        config.intervals.quorum,
        config.liveness_window,
        &scope,
        level,
    )
    .await
    else {
        return cancelled(&config);
    };

    if active.len() > QUORUM {
        warn!(
            participants = active.len(),
            "More than two participants share this token; the first acknowledgment wins"
        );
    }
    let peers: Vec<&String> = active.iter().filter(|id| **id != me).collect();

    loop {
        progress!(level, peers = peers.len(), "Waiting for acknowledgment");
        for peer in &peers {
            if channel.get_key(PAIRING, peer).is_some() {
                info!(peer = %me, acked_by = %peer, "Pairing complete, payload acknowledged");
                return Ok(PairingOutcome::Paired);
            }
            if !pause(&scope, config.intervals.ack).await {
                return cancelled(&config);
            }
        }
        if peers.is_empty() && !pause(&scope, config.intervals.ack).await {
            return cancelled(&config);
        }
    }
}

/// Sleeps for `interval` unless `cancel` fires first. Returns `false` on
/// cancellation.
async fn pause(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = sleep(interval) => true,
    }
}

fn cancelled(config: &PairConfig) -> Result<PairingOutcome, PairingError> {
    progress!(config.log_level, "Pairing cancelled before the handshake completed");
    match config.cancel_policy {
        CancelPolicy::Report => Ok(PairingOutcome::Cancelled),
        CancelPolicy::Fail => Err(PairingError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use nodepair_core::ledger::Ledger;
    use nodepair_core::{
        PollIntervals, with_cancel_policy, with_intervals, with_reader, with_token,
    };
    use proptest::prelude::*;
    use serde_json::{Map, json};
    use tokio::time::{Instant, timeout};

    use super::*;
    use crate::memory::MemoryNetwork;

    const DEADLINE: Duration = Duration::from_secs(600);

    fn foo_bar() -> HashMap<String, String> {
        HashMap::from([("foo".to_string(), "Bar".to_string())])
    }

    /// Spawns a task cancelling `token` after `delay`.
    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            token.cancel();
        });
    }

    /// Arbitrary JSON trees up to three levels deep.
    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            (-1.0e9f64..1.0e9).prop_map(Value::from),
            any::<String>().prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map(any::<String>(), inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// Pairs one sender and one receiver over a fresh in-memory network.
    async fn pair_once(payload: &Value) -> Value {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let fast = PollIntervals::uniform(Duration::from_millis(100));
        let mut received = Value::Null;

        let (r, s) = timeout(DEADLINE, async {
            tokio::join!(
                receive(
                    &factory,
                    &cancel,
                    &mut received,
                    [with_token("prop"), with_intervals(fast)]
                ),
                send(&factory, &cancel, payload, [with_token("prop"), with_intervals(fast)]),
            )
        })
        .await
        .expect("handshake did not finish");

        assert!(r.unwrap().is_paired());
        assert!(s.unwrap().is_paired());
        received
    }

    fn presence_ids(ledger: &Ledger) -> Vec<String> {
        ledger.snapshot(PRESENCE).into_keys().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn given_shared_literal_token_when_paired_then_destination_equals_payload() {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        let cancel = CancellationToken::new();
        let payload = foo_bar();
        let mut received: HashMap<String, String> = HashMap::new();

        let (received_outcome, sent_outcome) = timeout(DEADLINE, async {
            tokio::join!(
                receive(&factory, &cancel, &mut received, [with_token("ABC123")]),
                send(&factory, &cancel, &payload, [with_token("ABC123")]),
            )
        })
        .await
        .expect("handshake did not finish");

        assert_eq!(received_outcome.unwrap(), PairingOutcome::Paired);
        assert_eq!(sent_outcome.unwrap(), PairingOutcome::Paired);
        assert_eq!(received, payload);
        assert_eq!(factory.join_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn given_sender_starting_late_when_paired_then_payload_still_arrives() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let payload = json!({"nested": {"list": [1, 2, 3]}, "flag": true});
        let mut received = Value::Null;

        let delayed_send = async {
            sleep(Duration::from_secs(45)).await;
            send(&factory, &cancel, &payload, [with_token("late")]).await
        };

        let (r, s) = timeout(DEADLINE, async {
            tokio::join!(
                receive(&factory, &cancel, &mut received, [with_token("late")]),
                delayed_send,
            )
        })
        .await
        .expect("handshake did not finish");

        assert!(r.unwrap().is_paired());
        assert!(s.unwrap().is_paired());
        assert_eq!(received, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn given_sender_with_reader_when_paired_then_reader_resolves_token() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let payload = foo_bar();
        let mut received: HashMap<String, String> = HashMap::new();
        let qr_reader = |hint: &str| {
            if hint == "/tmp/photo.png" {
                "ABC123".to_string()
            } else {
                hint.to_string()
            }
        };

        let (r, s) = timeout(DEADLINE, async {
            tokio::join!(
                receive(&factory, &cancel, &mut received, [with_token("ABC123")]),
                send(
                    &factory,
                    &cancel,
                    &payload,
                    [with_reader(qr_reader), with_token("/tmp/photo.png")]
                ),
            )
        })
        .await
        .expect("handshake did not finish");

        assert!(r.unwrap().is_paired());
        assert!(s.unwrap().is_paired());
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn given_no_token_when_sending_then_missing_token_without_join() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let err = send(&factory, &cancel, &foo_bar(), [with_token("")])
            .await
            .unwrap_err();

        assert!(matches!(err, PairingError::MissingToken));
        assert_eq!(factory.join_count(), 0);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn given_no_token_when_receiving_then_missing_token_without_join() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let mut received: HashMap<String, String> = HashMap::new();

        let err = receive(&factory, &cancel, &mut received, Vec::<PairOption>::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PairingError::MissingToken));
        assert_eq!(factory.join_count(), 0);
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn given_unreachable_network_when_sending_then_channel_join_error() {
        let factory = MemoryNetwork::new().factory().failing();
        let cancel = CancellationToken::new();

        let err = send(&factory, &cancel, &foo_bar(), [with_token("ABC123")])
            .await
            .unwrap_err();

        assert!(matches!(err, PairingError::ChannelJoin(_)));
        assert_eq!(factory.join_count(), 1);
    }

    #[tokio::test]
    async fn given_unserializable_payload_when_sending_then_payload_error_before_join() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let payload = HashMap::from([((1u8, 2u8), "tuple keys are not JSON")]);

        let err = send(&factory, &cancel, &payload, [with_token("ABC123")])
            .await
            .unwrap_err();

        assert!(matches!(err, PairingError::Payload(_)));
        assert_eq!(factory.join_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn given_lonely_receiver_when_cancelled_then_returns_cancelled_and_stops_announcing() {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_secs(25));
        let mut received: HashMap<String, String> = HashMap::new();

        let started = Instant::now();
        let outcome = receive(&factory, &cancel, &mut received, [with_token("alone")])
            .await
            .unwrap();

        assert_eq!(outcome, PairingOutcome::Cancelled);
        assert!(started.elapsed() <= Duration::from_secs(25) + PollIntervals::default().quorum);
        assert!(received.is_empty());

        let room = network.room("alone");
        let ids = presence_ids(&room.lock());
        assert_eq!(ids.len(), 1);
        let frozen = room.lock().get(PRESENCE, &ids[0]).unwrap().last_seen;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(room.lock().get(PRESENCE, &ids[0]).unwrap().last_seen, frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn given_fail_policy_when_cancelled_then_cancelled_error() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_secs(5));
        let mut received = Value::Null;

        let err = receive(
            &factory,
            &cancel,
            &mut received,
            [with_token("alone"), with_cancel_policy(CancelPolicy::Fail)],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PairingError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn given_silent_peer_when_sender_cancelled_then_returns_within_one_interval() {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        network
            .room("ghosted")
            .lock()
            .upsert(PRESENCE, "ghost", json!(""), Instant::now());

        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_secs(30));

        let started = Instant::now();
        let outcome = send(&factory, &cancel, &foo_bar(), [with_token("ghosted")])
            .await
            .unwrap();

        assert_eq!(outcome, PairingOutcome::Cancelled);
        assert!(started.elapsed() <= Duration::from_secs(31));

        let room = network.room("ghosted");
        let data = room.lock().get(PAIRING, DATA_KEY).unwrap().value.clone();
        assert_eq!(data, json!({"foo": "Bar"}));
    }

    #[tokio::test(start_paused = true)]
    async fn given_stale_presence_when_receiving_then_stale_peer_does_not_make_quorum() {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        network
            .room("stale")
            .lock()
            .upsert(PRESENCE, "crashed", json!(""), Instant::now());
        network
            .room("stale")
            .lock()
            .upsert(PAIRING, DATA_KEY, json!({"foo": "Old"}), Instant::now());
        sleep(Duration::from_secs(20 * 60)).await;

        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_secs(60));
        let mut received: HashMap<String, String> = HashMap::new();

        let outcome = receive(&factory, &cancel, &mut received, [with_token("stale")])
            .await
            .unwrap();

        assert_eq!(outcome, PairingOutcome::Cancelled);
        assert!(received.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn given_mismatched_payload_shape_when_received_then_payload_error_and_sender_released() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let mut received: Vec<u32> = vec![9];

        let (r, s) = timeout(DEADLINE, async {
            tokio::join!(
                receive(&factory, &cancel, &mut received, [with_token("shape")]),
                send(&factory, &cancel, "not a list", [with_token("shape")]),
            )
        })
        .await
        .expect("handshake did not finish");

        assert!(matches!(r.unwrap_err(), PairingError::Payload(_)));
        assert!(s.unwrap().is_paired());
        assert_eq!(received, [9]);
    }

    #[tokio::test(start_paused = true)]
    async fn given_custom_intervals_when_paired_then_finishes_faster() {
        let factory = MemoryNetwork::new().factory();
        let cancel = CancellationToken::new();
        let fast = PollIntervals::uniform(Duration::from_millis(100));
        let mut received = Value::Null;

        let answer = json!(42);
        let started = Instant::now();
        let (r, s) = tokio::join!(
            receive(
                &factory,
                &cancel,
                &mut received,
                [with_token("fast"), with_intervals(fast)]
            ),
            send(
                &factory,
                &cancel,
                &answer,
                [with_token("fast"), with_intervals(fast)]
            ),
        );

        assert!(r.unwrap().is_paired());
        assert!(s.unwrap().is_paired());
        assert_eq!(received, json!(42));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Whatever JSON value is sent, the receiver ends up with an equal one.
        #[test]
        fn given_any_json_payload_when_paired_then_received_equals_sent(payload in arb_json()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let received = runtime.block_on(pair_once(&payload));

            prop_assert_eq!(received, payload);
        }
    }
}

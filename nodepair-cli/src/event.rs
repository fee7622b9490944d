use tokio::sync::broadcast;

use nodepair_engine::relay::RelayEvent;

use crate::ui::short_id;

/// Spawns a task that listens for relay events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<RelayEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(RelayEvent::Accepting { addr }) => {
                    println!("  ✔ Listening on {addr}");
                }
                Ok(RelayEvent::AcceptingStopped) => {
                    println!("  ⏹ Stopped accepting connections");
                }
                Ok(RelayEvent::PeerJoined { room, peer }) => {
                    println!(
                        "  📡 {peer} joined room {room}",
                        peer = short_id(&peer),
                        room = short_id(&room)
                    );
                }
                Ok(RelayEvent::PeerLeft { room, peer }) => {
                    println!(
                        "  👋 {peer} left room {room}",
                        peer = short_id(&peer),
                        room = short_id(&room)
                    );
                }
                Ok(RelayEvent::Error { message }) => {
                    println!("  ❌ Relay error: {message}");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("  ⚠ Missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

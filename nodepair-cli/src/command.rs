use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use nodepair_core::token::ConnectionData;
use nodepair_core::{PairOption, with_log_level, with_reader, with_token};
use nodepair_engine::relay::{Relay, RelayCmd, RelayConfig};
use nodepair_engine::relay_channel::RelayChannelFactory;
use nodepair_engine::tcp::{TcpConnector, TcpListenerFactory};
use nodepair_engine::{PairingOutcome, receive, send};

use crate::event::spawn_event_printer;
use crate::qr::{QrImageReader, render_terminal, save_png};
use crate::ui::{print_relay_banner, print_token_hint};

/// Level pairing progress is reported at from the command line.
const PROGRESS_LEVEL: &str = "info";

/// Where the token of a `send` comes from.
pub enum TokenSource {
    Literal(String),
    QrImage(String),
}

/// Handles `token`: prints a fresh token, optionally as QR codes too.
pub fn handle_token(relay: Option<String>, qr: bool, png: Option<&Path>) -> anyhow::Result<()> {
    let mut data = ConnectionData::generate();
    if let Some(addr) = relay {
        data = data.with_rendezvous(addr);
    }
    let token = data.encode();

    println!("{token}");
    if qr {
        println!("{}", render_terminal(&token)?);
    }
    if let Some(path) = png {
        save_png(&token, path)?;
        eprintln!("  🖼  QR code written to {}", path.display());
    }
    print_token_hint(&token);
    Ok(())
}

/// Handles `relay`: serves rooms on `listen` until Ctrl-C.
pub async fn handle_relay(listen: String, retention: Duration) -> anyhow::Result<()> {
    let handle = Relay.start(TcpListenerFactory, RelayConfig { retention });
    spawn_event_printer(handle.events_tx.subscribe());

    print_relay_banner(&listen, retention);
    handle
        .cmd_tx
        .send(RelayCmd::StartAccepting { addr: listen })
        .await
        .context("relay stopped unexpectedly")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    println!("\n  Shutting down...");
    let _ = handle.cmd_tx.send(RelayCmd::ShutDown).await;
    // Give sessions a moment to say goodbye.
    sleep(Duration::from_millis(200)).await;
    println!("  Bye! 👋");
    Ok(())
}

/// Handles `receive`: prints the received payload as JSON on stdout.
pub async fn handle_receive(
    token: String,
    relay: Option<String>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let factory = channel_factory(relay);
    let cancel = cancel_on_interrupt(timeout);

    let mut payload = Value::Null;
    let options = [with_token(token), with_log_level(PROGRESS_LEVEL)];
    let outcome = receive(&factory, &cancel, &mut payload, options).await?;
    ensure_paired(outcome)?;

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Handles `send`: delivers `payload` (JSON text) to the receiver.
pub async fn handle_send(
    payload: &str,
    source: TokenSource,
    relay: Option<String>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let factory = channel_factory(relay);
    let cancel = cancel_on_interrupt(timeout);

    let options: Vec<PairOption> = match source {
        TokenSource::Literal(token) => vec![with_token(token)],
        TokenSource::QrImage(path) => vec![with_token(path), with_reader(QrImageReader)],
    };
    let options = options
        .into_iter()
        .chain([with_log_level(PROGRESS_LEVEL)]);

    let outcome = send(&factory, &cancel, &payload, options).await?;
    ensure_paired(outcome)?;

    eprintln!("  ✅ Payload delivered");
    Ok(())
}

fn channel_factory(relay: Option<String>) -> RelayChannelFactory<TcpConnector> {
    let factory = RelayChannelFactory::new(TcpConnector);
    match relay {
        Some(addr) => factory.with_default_relay(addr),
        None => factory,
    }
}

fn ensure_paired(outcome: PairingOutcome) -> anyhow::Result<()> {
    match outcome {
        PairingOutcome::Paired => Ok(()),
        PairingOutcome::Cancelled => bail!("pairing cancelled before the handshake completed"),
    }
}

/// Returns a token cancelled on Ctrl-C or once `timeout` elapses.
fn cancel_on_interrupt(timeout: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted, cancelling pairing"),
            () = deadline => info!("Timed out, cancelling pairing"),
        }
        trigger.cancel();
    });
    cancel
}

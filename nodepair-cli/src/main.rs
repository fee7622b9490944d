mod command;
mod event;
mod qr;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use crate::command::{TokenSource, handle_receive, handle_relay, handle_send, handle_token};

/// nodepair: move one JSON payload between two machines that share a token.
///
/// Generate a token, give it to both sides, run `receive` on one and `send`
/// on the other. Both meet in a room on a relay and complete a short
/// announce / acknowledge handshake.
#[derive(Parser, Debug)]
#[command(name = "nodepair", version, about)]
struct Args {
    /// Log filter (e.g. "debug", "nodepair_engine=trace"). Overrides
    /// RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a pairing token.
    Token {
        /// Relay the token should point both sides to.
        #[arg(short, long)]
        relay: Option<String>,

        /// Also print the token as a QR code.
        #[arg(long)]
        qr: bool,

        /// Also write the token as a QR code PNG to this path.
        #[arg(long)]
        png: Option<PathBuf>,
    },

    /// Run a relay hosting pairing rooms.
    Relay {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:4343")]
        listen: String,

        /// Seconds an entry is kept without being re-announced.
        #[arg(long, default_value_t = 900)]
        retention: u64,
    },

    /// Wait for a payload and print it as JSON.
    Receive {
        /// Pairing token shared with the sender.
        #[arg(short, long)]
        token: String,

        /// Relay to use when the token names none.
        #[arg(short, long)]
        relay: Option<String>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send a JSON payload to the receiver holding the same token.
    #[command(group(ArgGroup::new("source").required(true).args(["token", "qr"])))]
    Send {
        /// JSON payload to deliver.
        #[arg(short, long)]
        payload: String,

        /// Pairing token shared with the receiver.
        #[arg(short, long)]
        token: Option<String>,

        /// Image holding the token as a QR code.
        #[arg(long)]
        qr: Option<String>,

        /// Relay to use when the token names none.
        #[arg(short, long)]
        relay: Option<String>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with tokens and payloads on
    // stdout. Library crates only report warnings unless asked otherwise.
    let filter = match args.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("nodepair_cli=info,nodepair_engine=info,warn")),
    };
    fmt().with_writer(std::io::stderr).with_env_filter(filter).init();

    let result = match args.command {
        Command::Token { relay, qr, png } => handle_token(relay, qr, png.as_deref()),
        Command::Relay { listen, retention } => {
            handle_relay(listen, Duration::from_secs(retention)).await
        }
        Command::Receive {
            token,
            relay,
            timeout,
        } => handle_receive(token, relay, timeout.map(Duration::from_secs)).await,
        Command::Send {
            payload,
            token,
            qr,
            relay,
            timeout,
        } => {
            let source = match (token, qr) {
                (Some(token), _) => TokenSource::Literal(token),
                (None, Some(image)) => TokenSource::QrImage(image),
                // clap requires one of the two.
                (None, None) => TokenSource::Literal(String::new()),
            };
            handle_send(&payload, source, relay, timeout.map(Duration::from_secs)).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("  ❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use tracing::Level;

use crate::error::PairingError;

/// Resolves a pairing token from an out-of-band hint.
///
/// The hint is whatever the caller passed as the token (often empty): a
/// path to a photographed QR code, a URI, or the token itself. A reader
/// that has nothing better to offer returns the hint unchanged.
pub trait TokenReader: Send + Sync + 'static {
    fn read_token(&self, hint: &str) -> String;
}

impl<F> TokenReader for F
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    fn read_token(&self, hint: &str) -> String {
        self(hint)
    }
}

/// How long each protocol wait sleeps between two polls of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// Between two presence snapshots while waiting for a quorum.
    pub quorum: Duration,
    /// Between two reads of `pairing/data` on the receiving side.
    pub payload: Duration,
    /// Between two acknowledgment reads.
    pub ack: Duration,
    /// Between two re-announcements of the same entry.
    pub announce: Duration,
}

impl PollIntervals {
    /// Uses the same interval for every wait. Handy for tests.
    #[must_use]
    pub fn uniform(every: Duration) -> Self {
        Self {
            quorum: every,
            payload: every,
            ack: every,
            announce: every,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("quorum", self.quorum),
            ("payload", self.payload),
            ("ack", self.ack),
            ("announce", self.announce),
        ] {
            ensure!(!value.is_zero(), "{name} interval must be non-zero");
        }
        Ok(())
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            quorum: Duration::from_secs(10),
            payload: Duration::from_secs(1),
            ack: Duration::from_secs(1),
            announce: Duration::from_secs(2),
        }
    }
}

/// What a pairing call reports when its cancel token fires mid-handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Return `Ok(PairingOutcome::Cancelled)`.
    #[default]
    Report,
    /// Return `Err(PairingError::Cancelled)`.
    Fail,
}

/// Default age after which a presence entry no longer counts as live.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Per-call pairing configuration, built by [`PairConfig::apply`].
pub struct PairConfig {
    pub token: String,
    pub token_reader: Option<Arc<dyn TokenReader>>,
    /// Level the protocol progress messages are logged at.
    pub log_level: Level,
    pub intervals: PollIntervals,
    pub liveness_window: Duration,
    pub cancel_policy: CancelPolicy,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            token_reader: None,
            log_level: Level::DEBUG,
            intervals: PollIntervals::default(),
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            cancel_policy: CancelPolicy::default(),
        }
    }
}

impl fmt::Debug for PairConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairConfig")
            .field("token", &self.token)
            .field("token_reader", &self.token_reader.is_some())
            .field("log_level", &self.log_level)
            .field("intervals", &self.intervals)
            .field("liveness_window", &self.liveness_window)
            .field("cancel_policy", &self.cancel_policy)
            .finish()
    }
}

impl PairConfig {
    /// Builds a configuration by running `options` in order over the
    /// defaults, then resolving the token through the reader (if any).
    ///
    /// Nothing here touches the network.
    ///
    /// # Errors
    ///
    /// [`PairingError::ConfigOption`] for the first option that fails,
    /// [`PairingError::MissingToken`] if the resolved token is empty.
    pub fn apply<I>(options: I) -> Result<Self, PairingError>
    where
        I: IntoIterator<Item = PairOption>,
    {
        let mut config = Self::default();
        for option in options {
            (option.0)(&mut config).map_err(PairingError::ConfigOption)?;
        }

        if let Some(reader) = &config.token_reader {
            config.token = reader.read_token(&config.token);
        }

        if config.token.is_empty() {
            return Err(PairingError::MissingToken);
        }
        Ok(config)
    }
}

type ApplyFn = Box<dyn FnOnce(&mut PairConfig) -> anyhow::Result<()> + Send>;

/// One configuration step for a pairing call.
pub struct PairOption(ApplyFn);

impl PairOption {
    /// Wraps an arbitrary, possibly failing, configuration step.
    pub fn custom<F>(apply: F) -> Self
    where
        F: FnOnce(&mut PairConfig) -> anyhow::Result<()> + Send + 'static,
    {
        Self(Box::new(apply))
    }
}

impl fmt::Debug for PairOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairOption(..)")
    }
}

/// Sets the token, or the hint handed to the token reader.
pub fn with_token(token: impl Into<String>) -> PairOption {
    let token = token.into();
    PairOption::custom(move |c| {
        c.token = token;
        Ok(())
    })
}

/// Installs the reader that turns the token hint into the real token.
pub fn with_reader(reader: impl TokenReader) -> PairOption {
    let reader: Arc<dyn TokenReader> = Arc::new(reader);
    PairOption::custom(move |c| {
        c.token_reader = Some(reader);
        Ok(())
    })
}

/// Sets the level protocol progress is logged at (`trace` … `error`).
///
/// `fatal` and `panic` are taken as `error`. An empty level leaves the
/// current one in place.
pub fn with_log_level(level: impl Into<String>) -> PairOption {
    let level = level.into();
    PairOption::custom(move |c| {
        if let Some(level) = parse_log_level(&level)? {
            c.log_level = level;
        }
        Ok(())
    })
}

fn parse_log_level(level: &str) -> anyhow::Result<Option<Level>> {
    let level = level.trim();
    if level.is_empty() {
        return Ok(None);
    }
    if level.eq_ignore_ascii_case("fatal") || level.eq_ignore_ascii_case("panic") {
        return Ok(Some(Level::ERROR));
    }
    level
        .parse()
        .map(Some)
        .map_err(|_| anyhow::anyhow!("unknown log level: {level:?}"))
}

/// Overrides the polling intervals.
pub fn with_intervals(intervals: PollIntervals) -> PairOption {
    PairOption::custom(move |c| {
        intervals.validate()?;
        c.intervals = intervals;
        Ok(())
    })
}

/// Overrides how old a presence entry may be and still count as live.
pub fn with_liveness_window(window: Duration) -> PairOption {
    PairOption::custom(move |c| {
        ensure!(!window.is_zero(), "liveness window must be non-zero");
        c.liveness_window = window;
        Ok(())
    })
}

pub fn with_cancel_policy(policy: CancelPolicy) -> PairOption {
    PairOption::custom(move |c| {
        c.cancel_policy = policy;
        Ok(())
    })
}

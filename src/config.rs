//! Configuration types for the exchange.

use crate::error::{Error, Result};
use crate::group::wire;
use crate::types::{KindTag, OperatingMode};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of requests carried by one cross-rank chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

/// Tag used for collective request streams.
pub const DEFAULT_COLLECTIVE_TAG: &str = "TAG";

/// Main configuration for the exchange.
#[derive(Debug, Clone, Default)]
pub struct GlueConfig {
    /// Store connection configuration.
    pub store: StoreConfig,

    /// Result polling configuration.
    pub poll: PollConfig,

    /// Collective broker configuration.
    pub collective: CollectiveConfig,
}

impl GlueConfig {
    /// Create a configuration for the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::new(path),
            ..Default::default()
        }
    }

    /// Set store configuration.
    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set polling configuration.
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Set collective configuration.
    pub fn with_collective_config(mut self, collective: CollectiveConfig) -> Self {
        self.collective = collective;
        self
    }

    /// Give up waiting for results after `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.poll.deadline = Some(deadline);
        self
    }

    /// Set the cross-rank chunk capacity.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.collective.chunk_capacity = capacity;
        self
    }

    /// Set how fatal store errors are handled.
    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.store.fatal_policy = policy;
        self
    }

    /// Reject configurations the protocols cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.collective.chunk_capacity == 0 {
            return Err(Error::Config("chunk capacity must be at least 1".into()));
        }
        let widest = KindTag::ALL
            .iter()
            .map(|kind| {
                let schema = kind.schema();
                schema.request_width().max(schema.result_width() + 1)
            })
            .max()
            .unwrap_or(1);
        let limit = wire::max_records(widest);
        if self.collective.chunk_capacity > limit {
            return Err(Error::Config(format!(
                "chunk capacity {} exceeds the {limit} records that fit in one transfer",
                self.collective.chunk_capacity
            )));
        }
        if self.collective.mode.is_kill() {
            return Err(Error::Config(
                "collective requests cannot use the kill-switch mode".into(),
            ));
        }
        if self.poll.max_backoff < self.poll.initial_backoff {
            return Err(Error::Config(format!(
                "max backoff {:?} below initial backoff {:?}",
                self.poll.max_backoff, self.poll.initial_backoff
            )));
        }
        if self.poll.multiplier < 1.0 {
            return Err(Error::Config("backoff multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

/// What the store client does after a non-transient store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and terminate the process. Pending requests cannot be retracted.
    #[default]
    Abort,
    /// Log and return the error to the caller.
    Propagate,
}

/// Store connection configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,

    /// How long SQLite itself waits on a locked database before reporting busy.
    pub busy_timeout: Duration,

    /// Create the request/result tables on connect if they do not exist.
    pub create_schema: bool,

    /// Handling of fatal store errors.
    pub fatal_policy: FatalPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("glue.db"),
            busy_timeout: Duration::from_millis(50),
            create_schema: false,
            fatal_policy: FatalPolicy::Abort,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the SQLite busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Create missing tables on connect.
    pub fn with_create_schema(mut self, create: bool) -> Self {
        self.create_schema = create;
        self
    }

    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }
}

/// Result polling configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause after the first empty poll round.
    pub initial_backoff: Duration,

    /// Upper bound for the pause between rounds.
    pub max_backoff: Duration,

    /// Growth factor applied to the pause after each empty round.
    pub multiplier: f64,

    /// Give up after this long. `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_micros(100),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            deadline: None,
        }
    }
}

impl PollConfig {
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Collective broker configuration.
#[derive(Debug, Clone)]
pub struct CollectiveConfig {
    /// Maximum number of requests in one cross-rank transfer.
    pub chunk_capacity: usize,

    /// Tag written on collective request rows.
    pub tag: String,

    /// Mode written on collective request rows.
    pub mode: OperatingMode,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            tag: DEFAULT_COLLECTIVE_TAG.to_string(),
            mode: OperatingMode::Default,
        }
    }
}

impl CollectiveConfig {
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlueConfig::new("/tmp/x.db");
        assert_eq!(config.collective.chunk_capacity, 1024);
        assert_eq!(config.collective.tag, "TAG");
        assert_eq!(config.collective.mode, OperatingMode::Default);
        assert_eq!(config.store.fatal_policy, FatalPolicy::Abort);
        assert!(config.poll.deadline.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = GlueConfig::default().with_chunk_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_capacity_beyond_frame_limit() {
        let limit = wire::max_records(13);
        assert!(GlueConfig::default().with_chunk_capacity(limit).validate().is_ok());
        let err = GlueConfig::default()
            .with_chunk_capacity(200_000)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("200000")));
    }

    #[test]
    fn test_validate_rejects_kill_collective() {
        let config = GlueConfig::default()
            .with_collective_config(CollectiveConfig::default().with_mode(OperatingMode::Kill));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let poll = PollConfig::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(1));
        let config = GlueConfig::default().with_poll_config(poll);
        assert!(config.validate().is_err());
    }
}

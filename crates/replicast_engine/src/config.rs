//! Configuration for the replica engine.

use crate::error::{EngineError, EngineResult};
use rand::Rng;
use replicast_protocol::ChannelName;
use std::collections::HashSet;
use std::time::Duration;

/// Path of the login endpoint relative to the service base URL.
pub const LOGIN_PATH: &str = "/api/login";
/// Path of the access-token endpoint relative to the service base URL.
pub const REFRESH_PATH: &str = "/api/load-token";

/// Configuration for a replica session.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Channels to mirror, in subscription order.
    pub channels: Vec<ChannelName>,
    /// Login endpoint URL.
    pub login_url: String,
    /// Access-token refresh endpoint URL.
    pub refresh_url: String,
    /// Reconnect backoff used by the transport.
    pub reconnect: ReconnectConfig,
    /// Timeout applied to HTTP exchanges and transport requests.
    pub request_timeout: Duration,
    /// Claim-code index over one of the channels.
    pub index: Option<IndexConfig>,
}

impl ReplicaConfig {
    /// Creates a configuration with explicit auth endpoints and no channels.
    pub fn new(login_url: impl Into<String>, refresh_url: impl Into<String>) -> Self {
        Self {
            channels: Vec::new(),
            login_url: login_url.into(),
            refresh_url: refresh_url.into(),
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(30),
            index: None,
        }
    }

    /// Creates a configuration for one organization on a service.
    ///
    /// Channels are named `/<entity-type>/<organization>` and the auth
    /// endpoints live under `base_url`.
    pub fn for_organization(
        base_url: &str,
        organization: &str,
        entity_types: &[&str],
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let channels = entity_types
            .iter()
            .map(|entity_type| ChannelName::new(*entity_type, organization))
            .collect();

        Self {
            channels,
            ..Self::new(format!("{base}{LOGIN_PATH}"), format!("{base}{REFRESH_PATH}"))
        }
    }

    /// Adds a channel.
    pub fn with_channel(mut self, channel: ChannelName) -> Self {
        self.channels.push(channel);
        self
    }

    /// Sets the reconnect configuration.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables the claim-code index.
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = Some(index);
        self
    }

    /// Returns the channel the claim-code index is built from.
    pub fn index_channel(&self) -> Option<&ChannelName> {
        let index = self.index.as_ref()?;
        self.channels
            .iter()
            .find(|c| c.entity_type() == index.source_type)
    }

    /// Checks that the configuration can drive a session.
    pub fn validate(&self) -> EngineResult<()> {
        if self.channels.is_empty() {
            return Err(EngineError::Config("no channels configured".into()));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel) {
                return Err(EngineError::Config(format!(
                    "channel {channel} configured twice"
                )));
            }
        }

        if let Some(index) = &self.index {
            if self.index_channel().is_none() {
                return Err(EngineError::Config(format!(
                    "index source `{}` is not a configured channel type",
                    index.source_type
                )));
            }
            if index.claim_field.is_empty() {
                return Err(EngineError::Config("index claim field is empty".into()));
            }
        }

        Ok(())
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Which channel feeds the claim-code index, and where the code lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Entity type of the source channel.
    pub source_type: String,
    /// Dotted path of the claim-code field.
    pub claim_field: String,
}

impl IndexConfig {
    /// Creates an index configuration.
    pub fn new(source_type: impl Into<String>, claim_field: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            claim_field: claim_field.into(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new("endpoints", "claimCode")
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl ReconnectConfig {
    /// Creates a configuration that retries forever.
    pub fn new() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Caps the number of consecutive attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = base_delay.min(max_secs);

        if self.add_jitter {
            // up to 25% jitter, never past max_delay
            let jitter = delay_secs * rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64((delay_secs + jitter).min(max_secs))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::new()
    }
}

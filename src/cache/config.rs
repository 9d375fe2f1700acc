//! Configuration for the cache system
//!
//! Staleness and eviction windows come in named tiers. Each query picks a
//! tier and may override its windows per call through [`QueryOptions`].

use crate::cache::retry::{Backoff, RetryPolicy};
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Named bundle of staleness, eviction and refresh parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// General application data
    #[default]
    Default,

    /// Rarely-changing aggregate data
    Slow,

    /// Live data refreshed on a fixed interval while in use
    Realtime,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Default => write!(f, "default"),
            Tier::Slow => write!(f, "slow"),
            Tier::Realtime => write!(f, "realtime"),
        }
    }
}

impl FromStr for Tier {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Tier::Default),
            "slow" => Ok(Tier::Slow),
            "realtime" | "real-time" => Ok(Tier::Realtime),
            other => Err(CacheError::ConfigError(format!("unknown tier: {}", other))),
        }
    }
}

/// Resolved timing windows for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// How long data stays fresh after a successful fetch
    pub stale_after: Duration,

    /// How long an entry with no readers survives
    pub evict_after: Duration,

    /// Unconditional background refresh period, if any
    pub refresh_interval: Option<Duration>,
}

impl TierPolicy {
    /// 5 minutes fresh, evicted 15 minutes after the last reader leaves
    pub fn default_tier() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            evict_after: Duration::from_secs(15 * 60),
            refresh_interval: None,
        }
    }

    /// 10 minutes fresh, 30 minutes idle before eviction
    pub fn slow() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            evict_after: Duration::from_secs(30 * 60),
            refresh_interval: None,
        }
    }

    /// 30 seconds fresh, 2 minutes idle, refreshed every 30 seconds
    pub fn realtime() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            evict_after: Duration::from_secs(2 * 60),
            refresh_interval: Some(Duration::from_secs(30)),
        }
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.evict_after.is_zero() {
            return Err(CacheError::ConfigError(format!(
                "{} tier: evict_after must be greater than 0",
                tier
            )));
        }
        if let Some(interval) = self.refresh_interval {
            if interval.is_zero() {
                return Err(CacheError::ConfigError(format!(
                    "{} tier: refresh_interval must be greater than 0",
                    tier
                )));
            }
        }
        Ok(())
    }
}

/// Per-query options; overrides take precedence over the tier's defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub tier: Tier,
    pub stale_after: Option<Duration>,
    pub evict_after: Option<Duration>,
    pub refresh_interval: Option<Duration>,
}

impl QueryOptions {
    pub fn tier(tier: Tier) -> Self {
        Self {
            tier,
            ..Default::default()
        }
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn evict_after(mut self, evict_after: Duration) -> Self {
        self.evict_after = Some(evict_after);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Apply these options on top of the configured tier
    pub fn resolve(&self, config: &CacheConfig) -> TierPolicy {
        let base = config.policy_for(self.tier);
        TierPolicy {
            stale_after: self.stale_after.unwrap_or(base.stale_after),
            evict_after: self.evict_after.unwrap_or(base.evict_after),
            refresh_interval: self.refresh_interval.or(base.refresh_interval),
        }
    }
}

impl From<Tier> for QueryOptions {
    fn from(tier: Tier) -> Self {
        QueryOptions::tier(tier)
    }
}

/// Configuration for the query cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Windows for [`Tier::Default`]
    pub default_tier: TierPolicy,

    /// Windows for [`Tier::Slow`]
    pub slow_tier: TierPolicy,

    /// Windows for [`Tier::Realtime`]
    pub realtime_tier: TierPolicy,

    /// Attempt ceiling and delay between attempts
    pub retry: RetryPolicy,

    /// Refresh stale in-use entries when the application regains focus.
    /// Off by default: revisiting a view should not cost a round-trip.
    pub refetch_on_focus: bool,

    /// Capacity of the cache event broadcast channel
    pub event_capacity: usize,

    /// Interval for the optional idle-entry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_tier: TierPolicy::default_tier(),
            slow_tier: TierPolicy::slow(),
            realtime_tier: TierPolicy::realtime(),
            retry: RetryPolicy::default(),
            refetch_on_focus: false,
            event_capacity: 256,
            // Sweep every 5 minutes
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Windows configured for a tier
    pub fn policy_for(&self, tier: Tier) -> TierPolicy {
        match tier {
            Tier::Default => self.default_tier,
            Tier::Slow => self.slow_tier,
            Tier::Realtime => self.realtime_tier,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.default_tier.validate(Tier::Default)?;
        self.slow_tier.validate(Tier::Slow)?;
        self.realtime_tier.validate(Tier::Realtime)?;

        if self.retry.max_attempts == 0 {
            return Err(CacheError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if let Backoff::Exponential { jitter, .. } = self.retry.backoff {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(CacheError::ConfigError(
                    "retry backoff jitter must be between 0.0 and 1.0".to_string(),
                ));
            }
        }

        if self.event_capacity == 0 {
            return Err(CacheError::ConfigError(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from the environment
    ///
    /// Reads a `.env` file if one exists, then applies any `QUERY_CACHE_*`
    /// variables on top of the defaults. Unset variables keep their default;
    /// unparsable ones are a configuration error.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CacheConfig::default();

        for (prefix, policy) in [
            ("DEFAULT", &mut config.default_tier),
            ("SLOW", &mut config.slow_tier),
            ("REALTIME", &mut config.realtime_tier),
        ] {
            if let Some(secs) = parse_var::<u64, _>(&lookup, &format!("QUERY_CACHE_{}_STALE_SECS", prefix))? {
                policy.stale_after = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_var::<u64, _>(&lookup, &format!("QUERY_CACHE_{}_EVICT_SECS", prefix))? {
                policy.evict_after = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERY_CACHE_REALTIME_REFRESH_SECS")? {
            config.realtime_tier.refresh_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(attempts) = parse_var::<u32, _>(&lookup, "QUERY_CACHE_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }

        let delay_ms = parse_var::<u64, _>(&lookup, "QUERY_CACHE_BACKOFF_MS")?;
        if let Some(kind) = lookup("QUERY_CACHE_BACKOFF") {
            config.retry.backoff = Backoff::from_name(&kind, delay_ms.map(Duration::from_millis))?;
        } else if let Some(ms) = delay_ms {
            config.retry.backoff = config.retry.backoff.with_base(Duration::from_millis(ms));
        }

        if let Some(enabled) = parse_var::<bool, _>(&lookup, "QUERY_CACHE_REFETCH_ON_FOCUS")? {
            config.refetch_on_focus = enabled;
        }

        if let Some(capacity) = parse_var::<usize, _>(&lookup, "QUERY_CACHE_EVENT_CAPACITY")? {
            config.event_capacity = capacity;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERY_CACHE_CLEANUP_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        debug!("Loaded cache config from environment: {:?}", config);
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_tier: Option<TierPolicy>,
    slow_tier: Option<TierPolicy>,
    realtime_tier: Option<TierPolicy>,
    retry: Option<RetryPolicy>,
    refetch_on_focus: Option<bool>,
    event_capacity: Option<usize>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Replace the windows of one tier
    pub fn tier(mut self, tier: Tier, policy: TierPolicy) -> Self {
        match tier {
            Tier::Default => self.default_tier = Some(policy),
            Tier::Slow => self.slow_tier = Some(policy),
            Tier::Realtime => self.realtime_tier = Some(policy),
        }
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Shorthand for the attempt ceiling
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        let mut retry = self.retry.unwrap_or_default();
        retry.max_attempts = attempts;
        self.retry = Some(retry);
        self
    }

    /// Shorthand for the delay between attempts
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        let mut retry = self.retry.unwrap_or_default();
        retry.backoff = backoff;
        self.retry = Some(retry);
        self
    }

    /// Enable or disable refresh on focus regain
    pub fn refetch_on_focus(mut self, enable: bool) -> Self {
        self.refetch_on_focus = Some(enable);
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Set the idle sweep interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_tier: self.default_tier.unwrap_or(defaults.default_tier),
            slow_tier: self.slow_tier.unwrap_or(defaults.slow_tier),
            realtime_tier: self.realtime_tier.unwrap_or(defaults.realtime_tier),
            retry: self.retry.unwrap_or(defaults.retry),
            refetch_on_focus: self.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

//! Session Configuration
//!
//! Tunables for negotiation, liveness and reconciliation. Every value has a
//! default and can be overridden from `EMBER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Backoff applied before re-negotiating a lost link.
///
/// Attempt `n` (1-based) waits `base_delay * multiplier^(n-1)`, capped at
/// `max_delay`. The default multiplier of 1.0 gives a fixed 2 s window.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Stop retrying after this many consecutive failures. `None` retries
    /// for as long as the session lives.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay, unlimited attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self { base_delay: delay, multiplier: 1.0, max_delay: delay, max_attempts: None }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64().max(self.base_delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }

    /// Whether retry number `attempt` (1-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Session tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshConfig {
    /// Simulation ticks per second driving `MeshSession::tick`.
    pub tick_rate: u32,
    /// Re-negotiation backoff.
    pub retry: RetryPolicy,
    /// A link that has not opened within this window is failed.
    pub handshake_timeout: Duration,
    /// An open link silent for longer than this is failed.
    pub link_timeout: Duration,
    /// Ping cadence per open link.
    pub ping_interval: Duration,
    /// Fraction of the remaining distance covered per tick.
    pub smoothing: f32,
    /// Remote entities older than this freeze.
    pub stale_after: Duration,
    /// Entity velocity ceiling at ingestion.
    pub max_entity_speed: f32,
    /// Projectile velocity ceiling at ingestion.
    pub max_projectile_speed: f32,
    /// Candidates kept per peer before its link exists.
    pub max_early_candidates: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            retry: RetryPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            link_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            smoothing: 0.2,
            stale_after: Duration::from_secs(1),
            max_entity_speed: 40.0,
            max_projectile_speed: 30.0,
            max_early_candidates: 32,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl MeshConfig {
    /// Create config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            tick_rate: env_parse("EMBER_TICK_RATE").unwrap_or(d.tick_rate),
            retry: RetryPolicy {
                base_delay: env_millis("EMBER_RETRY_BASE_MS").unwrap_or(d.retry.base_delay),
                multiplier: env_parse("EMBER_RETRY_MULTIPLIER").unwrap_or(d.retry.multiplier),
                max_delay: env_millis("EMBER_RETRY_MAX_MS").unwrap_or(d.retry.max_delay),
                max_attempts: env_parse("EMBER_RETRY_MAX_ATTEMPTS").or(d.retry.max_attempts),
            },
            handshake_timeout: env_millis("EMBER_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(d.handshake_timeout),
            link_timeout: env_millis("EMBER_LINK_TIMEOUT_MS").unwrap_or(d.link_timeout),
            ping_interval: env_millis("EMBER_PING_INTERVAL_MS").unwrap_or(d.ping_interval),
            smoothing: env_parse("EMBER_SMOOTHING").unwrap_or(d.smoothing),
            stale_after: env_millis("EMBER_STALE_AFTER_MS").unwrap_or(d.stale_after),
            max_entity_speed: env_parse("EMBER_MAX_ENTITY_SPEED").unwrap_or(d.max_entity_speed),
            max_projectile_speed: env_parse("EMBER_MAX_PROJECTILE_SPEED")
                .unwrap_or(d.max_projectile_speed),
            max_early_candidates: env_parse("EMBER_MAX_EARLY_CANDIDATES")
                .unwrap_or(d.max_early_candidates),
        }
    }

    /// Duration of one simulation tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_is_fixed_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(7), Duration::from_secs(2));
        assert!(policy.allows(1_000));
    }

    #[test]
    fn test_exponential_retry_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }

    #[test]
    fn test_tick_interval() {
        let config = MeshConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1) / 60);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("EMBER_RETRY_BASE_MS", "750");
        std::env::set_var("EMBER_SMOOTHING", "not-a-number");
        let config = MeshConfig::from_env();
        assert_eq!(config.retry.base_delay, Duration::from_millis(750));
        assert_eq!(config.smoothing, 0.2);
        std::env::remove_var("EMBER_RETRY_BASE_MS");
        std::env::remove_var("EMBER_SMOOTHING");
    }
}

//! Presence session configuration and the reconnect backoff policy.

use std::str::FromStr;
use std::time::Duration;

/// Bounded exponential backoff for reconnecting a presence session.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Retries after the initial attempt before giving up.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Grow `current` by the multiplier, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// retries are used up.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        Some(delay)
    }

    /// Every delay in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).filter_map(|r| self.delay_for(r)).collect()
    }
}

/// Presence session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    /// Feature flag. When off, sessions are inert no-ops.
    pub enabled: bool,
    /// Idle time after which `online` becomes `away`.
    pub away_timeout: Duration,
    /// Period of the inactivity sweep that backs up the away timer.
    pub inactivity_check_interval: Duration,
    /// Period of the liveness republish while connected.
    pub heartbeat_interval: Duration,
    /// Local changes made within this window go out in one publish.
    pub publish_debounce: Duration,
    /// How long a connect attempt may wait for `subscribed`.
    pub subscribe_timeout: Duration,
    /// Delay before the cleanup failsafe writes `offline` itself.
    pub cleanup_failsafe_delay: Duration,
    /// Rows fetched from the store to seed the member list.
    pub active_members_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            away_timeout: Duration::from_secs(120),
            inactivity_check_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            publish_debounce: Duration::from_millis(250),
            subscribe_timeout: Duration::from_secs(10),
            cleanup_failsafe_delay: Duration::from_secs(5),
            active_members_limit: 50,
            retry: RetryPolicy::default(),
        }
    }
}

impl PresenceConfig {
    /// Defaults overlaid with `WITHME_PRESENCE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(enabled) = parse_var::<bool>(&lookup, "WITHME_PRESENCE_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WITHME_PRESENCE_AWAY_TIMEOUT_SECS") {
            config.away_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WITHME_PRESENCE_HEARTBEAT_SECS") {
            if secs == 0 {
                log::warn!("WITHME_PRESENCE_HEARTBEAT_SECS must be positive, keeping default");
            } else {
                config.heartbeat_interval = Duration::from_secs(secs);
            }
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "WITHME_PRESENCE_MAX_RETRIES") {
            config.retry.max_retries = retries;
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring malformed {name}={raw:?}, keeping default");
            None
        }
    }
}

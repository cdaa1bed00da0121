//! Harness configuration loaded from environment variables.
//!
//! Slow CI machines sometimes need longer to bring a server up than a
//! developer laptop does, so the socket liveness budget can be tuned without
//! touching test code.
//!
//! # Environment Variables
//!
//! - `WADDLE_FIXTURE_SOCKET_ATTEMPTS`: Connection attempts per reserved socket. Default: `150`
//! - `WADDLE_FIXTURE_SOCKET_INTERVAL_MS`: Sleep between attempts. Default: `200`
//! - `WADDLE_FIXTURE_CONNECT_TIMEOUT_MS`: Timeout for a single attempt. Default: `1000`

use std::time::Duration;

use tracing::info;

const DEFAULT_SOCKET_POLL_ATTEMPTS: u32 = 150;
const DEFAULT_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Tuning knobs for the command lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// How many times a reserved socket is dialed before startup fails.
    pub socket_poll_attempts: u32,
    /// Sleep between failed dial attempts.
    pub socket_poll_interval: Duration,
    /// Upper bound on a single dial attempt.
    pub connect_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            socket_poll_attempts: DEFAULT_SOCKET_POLL_ATTEMPTS,
            socket_poll_interval: DEFAULT_SOCKET_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl HarnessConfig {
    /// Load harness configuration from environment variables.
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let socket_poll_attempts = parse("WADDLE_FIXTURE_SOCKET_ATTEMPTS")
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.socket_poll_attempts);
        let socket_poll_interval = parse("WADDLE_FIXTURE_SOCKET_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.socket_poll_interval);
        let connect_timeout = parse("WADDLE_FIXTURE_CONNECT_TIMEOUT_MS")
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        Self {
            socket_poll_attempts,
            socket_poll_interval,
            connect_timeout,
        }
    }

    /// Total time a socket may take to come up before startup gives up.
    pub fn socket_budget(&self) -> Duration {
        self.socket_poll_interval
            .saturating_add(self.connect_timeout)
            .saturating_mul(self.socket_poll_attempts)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            attempts = self.socket_poll_attempts,
            interval = ?self.socket_poll_interval,
            connect_timeout = ?self.connect_timeout,
            budget = ?self.socket_budget(),
            "Fixture socket polling configured"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = HarnessConfig::from_lookup(lookup(&[]));
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.socket_poll_attempts, 150);
        assert_eq!(config.socket_poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_overrides_from_env() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("WADDLE_FIXTURE_SOCKET_ATTEMPTS", "10"),
            ("WADDLE_FIXTURE_SOCKET_INTERVAL_MS", "50"),
            ("WADDLE_FIXTURE_CONNECT_TIMEOUT_MS", " 250 "),
        ]));
        assert_eq!(config.socket_poll_attempts, 10);
        assert_eq!(config.socket_poll_interval, Duration::from_millis(50));
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("WADDLE_FIXTURE_SOCKET_ATTEMPTS", "0"),
            ("WADDLE_FIXTURE_SOCKET_INTERVAL_MS", "soon"),
            ("WADDLE_FIXTURE_CONNECT_TIMEOUT_MS", "-1"),
        ]));
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_socket_budget() {
        let config = HarnessConfig {
            socket_poll_attempts: 4,
            socket_poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(400),
        };
        assert_eq!(config.socket_budget(), Duration::from_secs(2));
    }

    #[test]
    fn test_huge_env_values_saturate() {
        let max = u64::MAX.to_string();
        let config = HarnessConfig::from_lookup(lookup(&[
            ("WADDLE_FIXTURE_SOCKET_ATTEMPTS", "4294967295"),
            ("WADDLE_FIXTURE_SOCKET_INTERVAL_MS", max.as_str()),
            ("WADDLE_FIXTURE_CONNECT_TIMEOUT_MS", max.as_str()),
        ]));
        assert_eq!(config.socket_poll_attempts, u32::MAX);
        assert_eq!(config.socket_budget(), Duration::MAX);
        config.log_config();
    }
}

//! Configuration of the session lifecycle operations.

use std::{path::PathBuf, time::Duration};
use utils::{
    ISCSI_MAX_CONCURRENT_OPS, ISCSI_MAX_LOGIN_ATTEMPTS, ISCSI_MAX_RETRY_BACKOFF, ISCSI_OP_TIMEOUT,
    ISCSI_PROBE_TIMEOUT, ISCSI_RETRY_BACKOFF, ISCSI_WATCH_PERIOD,
};

/// Tunables of the session lifecycle operations.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the iscsiadm binary, looked up in the `PATH` if None.
    iscsiadm: Option<PathBuf>,
    /// Bound of a single discovery, login or logout exchange.
    op_timeout: Duration,
    /// Bound of a single connectivity probe.
    probe_timeout: Duration,
    /// Heartbeat of the watch loop.
    watch_period: Duration,
    /// Login attempts after which a failed session is left alone by the watch loop.
    max_login_attempts: u32,
    /// Backoff after the first failed login attempt.
    retry_backoff: Duration,
    /// Upper bound of the backoff between login attempts.
    max_retry_backoff: Duration,
    /// Maximum number of concurrent login or logout exchanges within a batch.
    max_concurrent_ops: usize,
}

fn default_duration(value: &str) -> Duration {
    humantime::parse_duration(value).expect("default duration should be valid")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            iscsiadm: None,
            op_timeout: default_duration(ISCSI_OP_TIMEOUT),
            probe_timeout: default_duration(ISCSI_PROBE_TIMEOUT),
            watch_period: default_duration(ISCSI_WATCH_PERIOD),
            max_login_attempts: ISCSI_MAX_LOGIN_ATTEMPTS,
            retry_backoff: default_duration(ISCSI_RETRY_BACKOFF),
            max_retry_backoff: default_duration(ISCSI_MAX_RETRY_BACKOFF),
            max_concurrent_ops: ISCSI_MAX_CONCURRENT_OPS,
        }
    }
}

impl SessionConfig {
    /// Get the iscsiadm binary path, if one was specified.
    pub fn iscsiadm(&self) -> Option<&PathBuf> {
        self.iscsiadm.as_ref()
    }
    /// Get the protocol exchange timeout.
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }
    /// Get the connectivity probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }
    /// Get the watch loop period.
    pub fn watch_period(&self) -> Duration {
        self.watch_period
    }
    /// Get the maximum number of login attempts.
    pub fn max_login_attempts(&self) -> u32 {
        self.max_login_attempts
    }
    /// Get the initial retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }
    /// Get the maximum retry backoff.
    pub fn max_retry_backoff(&self) -> Duration {
        self.max_retry_backoff
    }
    /// Get the maximum number of concurrent exchanges.
    pub fn max_concurrent_ops(&self) -> usize {
        self.max_concurrent_ops
    }

    /// Use the given iscsiadm binary.
    pub fn with_iscsiadm(mut self, iscsiadm: Option<PathBuf>) -> Self {
        self.iscsiadm = iscsiadm;
        self
    }
    /// Use the given protocol exchange timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }
    /// Use the given connectivity probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
    /// Use the given watch loop period.
    pub fn with_watch_period(mut self, period: Duration) -> Self {
        self.watch_period = period;
        self
    }
    /// Use the given maximum number of login attempts, at least 1.
    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts.max(1);
        self
    }
    /// Use the given backoff bounds, `max` is raised to `initial` if lower.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max.max(initial);
        self
    }
    /// Use the given maximum number of concurrent exchanges, at least 1.
    pub fn with_max_concurrent_ops(mut self, ops: usize) -> Self {
        self.max_concurrent_ops = ops.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.op_timeout(), Duration::from_secs(20));
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.watch_period(), Duration::from_secs(30));
        assert_eq!(config.max_login_attempts(), 5);
        assert_eq!(config.retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.max_retry_backoff(), Duration::from_secs(300));
        assert_eq!(config.max_concurrent_ops(), 8);
        assert!(config.iscsiadm().is_none());
    }

    #[test]
    fn bounds() {
        let config = SessionConfig::default()
            .with_max_login_attempts(0)
            .with_max_concurrent_ops(0)
            .with_retry_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(config.max_login_attempts(), 1);
        assert_eq!(config.max_concurrent_ops(), 1);
        assert_eq!(config.max_retry_backoff(), Duration::from_secs(10));
    }
}

//! Various common constants used by the iSCSI session components.

/// The well-known iSCSI port, used when a portal doesn't carry one.
pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// The initiator administration binary.
pub const ISCSIADM_BINARY: &str = "iscsiadm";

/// Sysfs class directory where the kernel exposes the iSCSI sessions.
pub const ISCSI_SESSION_SYSFS_CLASS: &str = "/sys/class/iscsi_session";

/// Timeout for a single discovery, login or logout exchange.
pub const ISCSI_OP_TIMEOUT: &str = "20s";

/// Timeout for a single connectivity probe to a portal.
pub const ISCSI_PROBE_TIMEOUT: &str = "2s";

/// The period at which the session watcher re-validates the sessions.
pub const ISCSI_WATCH_PERIOD: &str = "30s";

/// Number of consecutive login attempts after which a session is left failed.
pub const ISCSI_MAX_LOGIN_ATTEMPTS: u32 = 5;

/// Initial delay between login retries, doubled on every failed attempt.
pub const ISCSI_RETRY_BACKOFF: &str = "5s";

/// Upper bound of the delay between login retries.
pub const ISCSI_MAX_RETRY_BACKOFF: &str = "5m";

/// Maximum number of login/logout exchanges in flight at once.
pub const ISCSI_MAX_CONCURRENT_OPS: usize = 8;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

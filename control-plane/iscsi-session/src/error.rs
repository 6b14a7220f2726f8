//! Error definitions for the session lifecycle operations.
//!
//! [`InitiatorError`] describes why a single exchange with the initiator failed, while [`Error`]
//! puts that cause in the context of a portal or a target. Only [`Error::InvalidInput`] is fatal
//! to an invocation, every other variant is collected per portal or per target.

use crate::{portal::Portal, session::SessionState, target::SessionKey};
use snafu::Snafu;
use std::time::Duration;

/// Failures of a single exchange with the iSCSI initiator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum InitiatorError {
    #[snafu(display("Cannot find the {binary} binary: {source}"))]
    BinaryNotFound { binary: String, source: which::Error },
    #[snafu(display("Failed to execute {binary}: {source}"))]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[snafu(display("{binary} {operation} failed with exit code {code:?}: {stderr}"))]
    CommandFailed {
        binary: String,
        operation: String,
        code: Option<i32>,
        stderr: String,
    },
    #[snafu(display("Malformed {operation} output: '{line}'"))]
    MalformedOutput { operation: String, line: String },
    #[snafu(display("Invalid target name '{name}'"))]
    InvalidTarget { name: String },
    #[snafu(display("Portal {portal} is not reachable"))]
    Unreachable { portal: String },
    #[snafu(display("Timed out during {operation} operation after {timeout:?}"))]
    Timeout { operation: String, timeout: Duration },
    #[snafu(display("Session to {iqn} via {portal} exists but is not logged in"))]
    SessionUnhealthy { portal: String, iqn: String },
}

impl InitiatorError {
    /// A retryable failure is expected to go away on its own, without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unreachable { .. })
    }
}

/// Errors of the portal, discovery and session operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Invalid portal list '{input}': {reason}"))]
    InvalidInput { input: String, reason: String },
    #[snafu(display("Discovery on portal {portal} failed: {source}"))]
    Discovery {
        portal: Portal,
        source: InitiatorError,
    },
    #[snafu(display("Login to target {iqn} via portal {portal} failed: {source}"))]
    Login {
        portal: Portal,
        iqn: String,
        source: InitiatorError,
    },
    #[snafu(display("Logout from target {iqn} via portal {portal} failed: {source}"))]
    Logout {
        portal: Portal,
        iqn: String,
        source: InitiatorError,
    },
    #[snafu(display("Session {key} cannot transition from {from} to {to}"))]
    InvalidTransition {
        key: SessionKey,
        from: SessionState,
        to: SessionState,
    },
    #[snafu(display("Session {key} is not tracked"))]
    NotTracked { key: SessionKey },
}

impl Error {
    /// Whether the underlying cause is transient, eg: a timeout.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Discovery { source, .. }
            | Self::Login { source, .. }
            | Self::Logout { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

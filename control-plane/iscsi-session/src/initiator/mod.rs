//! The iSCSI initiator seam.
//!
//! Every protocol exchange goes through the [`Initiator`] trait, so that the session lifecycle
//! can be driven against the host's open-iscsi tools ([`iscsiadm::IscsiAdm`]) or against any
//! other implementation.

use crate::{
    error::{InitiatorError, Timeout},
    portal::Portal,
    target::Target,
};
use std::{future::Future, time::Duration};

pub mod iscsiadm;

/// A session which currently exists on the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    /// The portal the session is connected through.
    pub portal: Portal,
    /// The target name.
    pub iqn: String,
    /// Whether the session is logged in and usable.
    pub healthy: bool,
}

/// Protocol exchanges with an iSCSI initiator.
#[async_trait::async_trait]
pub trait Initiator: Send + Sync {
    /// Query the portal for the names of the targets it exports.
    async fn discover(&self, portal: &Portal) -> Result<Vec<String>, InitiatorError>;
    /// Log in to the target through its portal.
    /// Logging in to a target with an existing session is not an error.
    async fn login(&self, target: &Target) -> Result<(), InitiatorError>;
    /// Log out from the target, returning false if there was no session to log out from.
    async fn logout(&self, target: &Target) -> Result<bool, InitiatorError>;
    /// List the sessions which currently exist on the initiator.
    async fn sessions(&self) -> Result<Vec<LiveSession>, InitiatorError>;
}

/// Bound an initiator exchange by a timeout.
/// When the timeout elapses the exchange future is dropped, which leaves any spawned process
/// running to completion.
pub(crate) async fn with_timeout<T>(
    operation: &str,
    timeout: Duration,
    exchange: impl Future<Output = Result<T, InitiatorError>>,
) -> Result<T, InitiatorError> {
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Timeout { operation, timeout }.fail(),
    }
}

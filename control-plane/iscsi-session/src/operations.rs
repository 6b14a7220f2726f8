//! Discovery driven batches over a whole portal set, as run by the `login` and `logout`
//! subcommands.

use crate::{
    error::Error,
    manager::{LoginReport, LogoutReport, SessionManager},
    portal::PortalSet,
    target::Target,
};
use indexmap::IndexMap;
use shutdown::ShutdownSignal;

/// Outcome of a batch over a portal set.
#[derive(Debug)]
pub struct BatchReport<R> {
    /// Per portal reports, in portal order.
    pub portals: Vec<R>,
    /// Portals whose discovery failed.
    pub discovery_failures: Vec<Error>,
}

impl<R> Default for BatchReport<R> {
    fn default() -> Self {
        Self {
            portals: vec![],
            discovery_failures: vec![],
        }
    }
}

impl<R> BatchReport<R> {
    fn log_discovery_failures(&self) {
        for error in &self.discovery_failures {
            tracing::error!(%error, "Portal discovery failed");
        }
    }
}

impl BatchReport<LoginReport> {
    /// Log every per portal and per target outcome, followed by the totals.
    pub fn log(&self) {
        self.log_discovery_failures();
        self.portals.iter().for_each(LoginReport::log);
        tracing::info!(
            portals = self.portals.len() + self.discovery_failures.len(),
            discovery_failures = self.discovery_failures.len(),
            active = self.portals.iter().map(|r| r.active.len()).sum::<usize>(),
            failed = self.portals.iter().map(|r| r.failed.len()).sum::<usize>(),
            "Login batch completed"
        );
    }
}

impl BatchReport<LogoutReport> {
    /// Log every per portal and per target outcome, followed by the totals.
    pub fn log(&self) {
        self.log_discovery_failures();
        self.portals.iter().for_each(LogoutReport::log);
        tracing::info!(
            portals = self.portals.len() + self.discovery_failures.len(),
            discovery_failures = self.discovery_failures.len(),
            logged_out = self.portals.iter().map(|r| r.logged_out.len()).sum::<usize>(),
            failed = self.portals.iter().map(|r| r.failed.len()).sum::<usize>(),
            "Logout batch completed"
        );
    }
}

impl SessionManager {
    /// Pick up the sessions which already exist on the initiator.
    /// A failure is only logged, the batch proceeds with what is tracked.
    async fn reconcile_before_batch(&self) {
        match self.reconcile().await {
            Ok(reconciled) => {
                tracing::debug!(?reconciled, "Reconciled with the initiator sessions")
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to list the initiator sessions")
            }
        }
    }

    /// Discover the targets of every portal and log in to all of them.
    /// Discovery failures and per target login failures are reported, never raised.
    pub async fn discover_and_login(
        &self,
        portals: &PortalSet,
        shutdown: Option<&ShutdownSignal>,
    ) -> BatchReport<LoginReport> {
        self.reconcile_before_batch().await;

        let mut report = BatchReport::default();
        for (portal, discovery) in self.discoverer().discover_all(portals).await {
            match discovery {
                Ok(targets) => {
                    for target in &targets {
                        self.table().track_discovered(target);
                    }
                    report
                        .portals
                        .push(self.login_all(&portal, targets, shutdown).await);
                }
                Err(error) => report.discovery_failures.push(error),
            }
        }
        report
    }

    /// Discover the targets of every portal and log out from all of them.
    ///
    /// Besides the discovered targets, every tracked session of the portal is torn down, so that
    /// a portal which can no longer be discovered still gets its sessions logged out.
    pub async fn discover_and_logout(
        &self,
        portals: &PortalSet,
        shutdown: Option<&ShutdownSignal>,
    ) -> BatchReport<LogoutReport> {
        self.reconcile_before_batch().await;

        let mut report = BatchReport::default();
        for (portal, discovery) in self.discoverer().discover_all(portals).await {
            let mut targets = IndexMap::new();
            match discovery {
                Ok(discovered) => {
                    targets.extend(discovered.into_iter().map(|t| (t.key(), t)));
                }
                Err(error) => report.discovery_failures.push(error),
            }
            for target in self.tracked_targets(&portal.endpoint()) {
                targets.entry(target.key()).or_insert(target);
            }
            if targets.is_empty() {
                continue;
            }
            let targets = targets.into_values().collect::<Vec<Target>>();
            report
                .portals
                .push(self.logout_all(&portal, targets, shutdown).await);
        }
        report
    }
}

//! The watch loop which keeps the tracked sessions logged in.

use crate::{
    manager::{Operation, SessionManager},
    portal::Portal,
    session::Session,
    store::SessionSummary,
};
use indexmap::IndexMap;
use shutdown::ShutdownSignal;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Exponential backoff between login attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Return a new `Self` doubling from `initial`, capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
    /// Delay to observe after the given number of consecutive attempts.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
    /// Whether the session's next login attempt is due at `now`.
    pub fn is_due(&self, session: &Session, now: Instant) -> bool {
        match session.last_attempt() {
            None => true,
            Some(last) => now >= last + self.delay(session.attempts()),
        }
    }
}

/// Summary of one watch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Portals being watched.
    pub portals: usize,
    /// Portals whose discovery failed in this cycle.
    pub discovery_failures: usize,
    /// Login attempts made in this cycle.
    pub attempted: usize,
    /// Login attempts which made the session active.
    pub recovered: usize,
    /// Sessions per state, after the cycle.
    pub sessions: SessionSummary,
}

impl CycleSummary {
    /// Log the summary.
    pub fn log(&self) {
        let sessions = &self.sessions;
        if sessions.exhausted > 0 {
            tracing::warn!(
                exhausted = sessions.exhausted,
                "Sessions have exhausted their login attempts"
            );
        }
        tracing::info!(
            portals = self.portals,
            discovery_failures = self.discovery_failures,
            attempted = self.attempted,
            recovered = self.recovered,
            active = sessions.active,
            failed = sessions.failed,
            disconnected = sessions.disconnected,
            "Watch cycle completed"
        );
    }
}

/// Keeps the tracked sessions alive.
///
/// Each cycle rediscovers the watched portals, checks the health of the tracked sessions against
/// the initiator and re-drives the login of every session which is not active, with a bounded
/// number of attempts and a backoff between them.
#[derive(Debug)]
pub struct SessionWatcher {
    manager: Arc<SessionManager>,
    portals: IndexMap<String, Portal>,
    backoff: Backoff,
}

impl SessionWatcher {
    /// Return a new `Self` watching the sessions of the manager.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let config = manager.config();
        let backoff = Backoff::new(config.retry_backoff(), config.max_retry_backoff());
        Self {
            manager,
            portals: IndexMap::new(),
            backoff,
        }
    }
    /// Watch the given portals, in addition to the portals of the tracked sessions.
    pub fn with_portals<'a>(mut self, portals: impl IntoIterator<Item = &'a Portal>) -> Self {
        for portal in portals {
            self.watch_portal(portal.clone());
        }
        self
    }

    /// The watched portals.
    pub fn portals(&self) -> Vec<&Portal> {
        self.portals.values().collect()
    }

    fn watch_portal(&mut self, portal: Portal) {
        let endpoint = portal.endpoint();
        if !self.portals.contains_key(&endpoint) {
            tracing::info!(portal = %portal, "Watching portal");
            self.portals.insert(endpoint, portal);
        }
    }
    fn watch_tracked_portals(&mut self) {
        for portal in self.manager.table().portals() {
            self.watch_portal(portal);
        }
    }

    /// Run the watch loop until the shutdown is triggered.
    /// A cycle in progress when the shutdown is triggered starts no new login, but lets the
    /// logins in flight complete.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let period = self.manager.config().watch_period();
        match self.manager.reconcile().await {
            Ok(reconciled) => tracing::info!(
                adopted = reconciled.adopted,
                "Reconciled with the initiator sessions"
            ),
            Err(error) => tracing::error!(%error, "Failed to list the initiator sessions"),
        }
        self.watch_tracked_portals();
        tracing::info!(?period, portals = self.portals.len(), "Starting the session watcher");

        let shutdown_wait = shutdown.wait();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                reason = &mut shutdown_wait => {
                    tracing::info!(reason = ?reason, "Stopping the session watcher");
                    break;
                }
                _ = tokio::time::sleep(period) => {}
            }
            self.cycle(Some(&shutdown)).await.log();
        }
    }

    /// Run a single watch cycle.
    pub async fn cycle(&mut self, shutdown: Option<&ShutdownSignal>) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let manager = self.manager.clone();
        let table = manager.table();

        // 1. rediscover, new targets are tracked as Discovered
        for (portal, discovery) in manager.discoverer().discover_all(self.portals.values()).await {
            match discovery {
                Ok(targets) => {
                    for target in &targets {
                        table.track_discovered(target);
                    }
                }
                Err(error) => {
                    tracing::warn!(portal = %portal, %error, "Portal discovery failed");
                    summary.discovery_failures += 1;
                }
            }
        }

        // 2. health check
        match manager.reconcile().await {
            Ok(reconciled) => tracing::debug!(?reconciled, "Checked the session health"),
            Err(error) => tracing::error!(%error, "Failed to check the session health"),
        }
        self.watch_tracked_portals();
        summary.portals = self.portals.len();

        // 3. re-drive the logins which are due
        let max_attempts = manager.config().max_login_attempts();
        let now = Instant::now();
        let due = table
            .snapshot()
            .into_iter()
            .filter(|s| s.state().needs_login() && !s.is_exhausted(max_attempts))
            .filter(|s| self.backoff.is_due(s, now))
            .map(|s| s.target().clone())
            .collect::<Vec<_>>();
        for (target, outcome) in manager.apply_all(Operation::Login, due, shutdown).await {
            summary.attempted += 1;
            match outcome {
                Ok(_) => summary.recovered += 1,
                Err(error) => {
                    let attempts = table.get(&target.key()).map(|s| s.attempts());
                    tracing::warn!(
                        iqn = target.iqn(),
                        portal = %target.portal(),
                        ?attempts,
                        max_attempts,
                        %error,
                        "Login attempt failed"
                    );
                }
            }
        }

        summary.sessions = table.summary(max_attempts);
        summary
    }
}

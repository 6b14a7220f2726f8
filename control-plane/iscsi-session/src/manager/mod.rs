//! Drives login and logout exchanges against the initiator, keeping the session table in step.

use crate::{
    config::SessionConfig,
    discovery::TargetDiscoverer,
    error::{Error, InitiatorError},
    initiator::{with_timeout, Initiator},
    probe::ConnectivityProbe,
    session::{Session, SessionState},
    store::SessionTable,
    target::{SessionKey, Target},
};
use futures::{future, StreamExt};
use shutdown::ShutdownSignal;
use std::{collections::HashSet, sync::Arc};
use tokio::time::Instant;

mod login;
mod logout;

pub use login::LoginReport;
pub use logout::LogoutReport;

/// Session operations which can be applied to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Operation {
    Login,
    Logout,
}

/// Successful outcome of an [`Operation`].
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The session is active.
    Active(Session),
    /// The session was torn down.
    LoggedOut,
    /// There was no session to tear down.
    NoSession,
}

/// Changes applied to the session table by a reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Live sessions which were not tracked before.
    pub adopted: usize,
    /// Active sessions which are no longer healthy on the initiator.
    pub disconnected: usize,
    /// Disconnected or failed sessions which were found healthy on the initiator.
    pub recovered: usize,
}

/// Manages the sessions of this initiator.
pub struct SessionManager {
    initiator: Arc<dyn Initiator>,
    discoverer: TargetDiscoverer,
    table: Arc<SessionTable>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}

impl SessionManager {
    /// Return a new `Self` operating on the given session table.
    pub fn new(
        initiator: Arc<dyn Initiator>,
        probe: Arc<dyn ConnectivityProbe>,
        table: Arc<SessionTable>,
        config: SessionConfig,
    ) -> Self {
        let discoverer = TargetDiscoverer::new(initiator.clone(), probe, config.op_timeout());
        Self {
            initiator,
            discoverer,
            table,
            config,
        }
    }

    /// Get a reference to the session table.
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }
    /// Get a reference to the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
    /// Get a reference to the target discoverer.
    pub fn discoverer(&self) -> &TargetDiscoverer {
        &self.discoverer
    }

    /// Bring the session table in line with the sessions which exist on the initiator.
    ///
    /// Live sessions which are not tracked are adopted, as `Active` when healthy and as
    /// `Disconnected` otherwise. Tracked `Active` sessions which are missing or unhealthy are
    /// marked `Disconnected`, while `Disconnected` or `Failed` sessions which are healthy on the
    /// initiator are marked `Active` again. Sessions with an exchange in flight are left alone.
    pub async fn reconcile(&self) -> Result<Reconciled, InitiatorError> {
        let observed_at = Instant::now();
        let live = with_timeout(
            "session listing",
            self.config.op_timeout(),
            self.initiator.sessions(),
        )
        .await?;

        let mut reconciled = Reconciled::default();
        let mut healthy = HashSet::with_capacity(live.len());
        for session in live {
            let target = Target::new(session.iqn, session.portal);
            if session.healthy {
                healthy.insert(target.key());
            } else {
                tracing::debug!(iqn = target.iqn(), portal = %target.portal(), "Live session is not healthy");
            }
            if self.table.adopt(target, session.healthy) {
                reconciled.adopted += 1;
            }
        }

        for session in self.table.snapshot() {
            let key = session.key();
            if self.table.is_busy(&key) {
                continue;
            }
            let target = session.target();
            match (session.state(), healthy.contains(&key)) {
                (SessionState::Active, false) => {
                    if self.table.mark_disconnected(&key, observed_at) {
                        tracing::warn!(
                            iqn = target.iqn(),
                            portal = %target.portal(),
                            "Session is no longer logged in"
                        );
                        reconciled.disconnected += 1;
                    }
                }
                (SessionState::Disconnected | SessionState::Failed, true) => {
                    if self.table.mark_recovered(&key, observed_at) {
                        tracing::info!(
                            iqn = target.iqn(),
                            portal = %target.portal(),
                            "Session is logged in again"
                        );
                        reconciled.recovered += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(reconciled)
    }

    /// Apply the operation to the target.
    pub async fn apply(&self, operation: Operation, target: &Target) -> Result<Outcome, Error> {
        match operation {
            Operation::Login => self.login(target).await.map(Outcome::Active),
            Operation::Logout => self.logout(target).await.map(|logged_out| match logged_out {
                true => Outcome::LoggedOut,
                false => Outcome::NoSession,
            }),
        }
    }

    /// Apply the operation to every target, with up to `max_concurrent_ops` exchanges in flight.
    /// Every target gets its own outcome, in the order of `targets`. Once the shutdown is
    /// triggered no further exchange is started and the remaining targets are left out.
    pub(crate) async fn apply_all(
        &self,
        operation: Operation,
        targets: Vec<Target>,
        shutdown: Option<&ShutdownSignal>,
    ) -> Vec<(Target, Result<Outcome, Error>)> {
        let outcomes = futures::stream::iter(targets)
            .take_while(|_| future::ready(!shutdown.map(|s| s.is_triggered()).unwrap_or(false)))
            .map(|target| async move {
                let outcome = self.apply(operation, &target).await;
                (target, outcome)
            })
            .buffered(self.config.max_concurrent_ops())
            .collect::<Vec<_>>()
            .await;
        self.table.prune_locks();
        outcomes
    }

    /// Tracked sessions of the portal with the given endpoint, which may need to be torn down.
    pub(crate) fn tracked_targets(&self, endpoint: &str) -> Vec<Target> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|s| s.key().endpoint() == endpoint && s.state() != SessionState::Discovered)
            .map(|s| s.target().clone())
            .collect()
    }

    /// Serialize the exchanges on the given session.
    async fn lock_target(&self, key: &SessionKey) -> tokio::sync::OwnedMutexGuard<()> {
        self.table.target_lock(key).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{portal::Portal, test_utils::FakeInitiator};
    use std::time::Duration;

    pub(super) fn manager(fake: &FakeInitiator, config: SessionConfig) -> SessionManager {
        let fake = Arc::new(fake.clone());
        SessionManager::new(fake.clone(), fake, Arc::new(SessionTable::new()), config)
    }

    pub(super) fn target(address: &str, name: &str) -> Target {
        Target::new(
            format!("iqn.2024-01.io.example:{name}"),
            Portal::new(address, None),
        )
    }

    #[tokio::test]
    async fn reconcile_adopts_and_disconnects() {
        let fake = FakeInitiator::new();
        let manager = manager(&fake, SessionConfig::default());
        let portal = Portal::new("10.0.0.1", None);
        fake.add_live(&portal, "iqn.2024-01.io.example:a", true);
        fake.add_live(&portal, "iqn.2024-01.io.example:b", false);

        let reconciled = manager.reconcile().await.unwrap();
        assert_eq!(
            reconciled,
            Reconciled {
                adopted: 2,
                disconnected: 0,
                recovered: 0,
            }
        );
        let key = target("10.0.0.1", "a").key();
        assert_eq!(
            manager.table().get(&key).unwrap().state(),
            SessionState::Active
        );
        // tracked, so that it can still be logged out from
        assert_eq!(
            manager.table().get(&target("10.0.0.1", "b").key()).unwrap().state(),
            SessionState::Disconnected
        );

        fake.drop_session(&portal, "iqn.2024-01.io.example:a");
        let reconciled = manager.reconcile().await.unwrap();
        assert_eq!(reconciled.disconnected, 1);
        assert_eq!(
            manager.table().get(&key).unwrap().state(),
            SessionState::Disconnected
        );
        // already disconnected
        assert_eq!(manager.reconcile().await.unwrap(), Reconciled::default());

        // logged in again out of band
        fake.add_live(&portal, "iqn.2024-01.io.example:a", true);
        let reconciled = manager.reconcile().await.unwrap();
        assert_eq!(reconciled.recovered, 1);
        assert_eq!(
            manager.table().get(&key).unwrap().state(),
            SessionState::Active
        );
        assert_eq!(fake.calls().login, 0);
    }

    #[tokio::test]
    async fn reconcile_leaves_busy_sessions_alone() {
        let fake = FakeInitiator::new();
        let manager = manager(&fake, SessionConfig::default());
        let portal = Portal::new("10.0.0.1", None);
        let key = target("10.0.0.1", "a").key();
        fake.add_live(&portal, "iqn.2024-01.io.example:a", false);
        manager.reconcile().await.unwrap();

        fake.add_live(&portal, "iqn.2024-01.io.example:a", true);
        let lock = manager.table().target_lock(&key);
        let guard = lock.lock().await;
        assert_eq!(manager.reconcile().await.unwrap(), Reconciled::default());
        assert_eq!(
            manager.table().get(&key).unwrap().state(),
            SessionState::Disconnected
        );
        drop(guard);
        assert_eq!(manager.reconcile().await.unwrap().recovered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_logins_never_overlap() {
        let fake = FakeInitiator::new();
        fake.set_delay(Duration::from_millis(100));
        let manager = Arc::new(manager(&fake, SessionConfig::default()));
        let target = target("10.0.0.1", "a");

        let logins = (0 .. 8).map(|_| {
            let manager = manager.clone();
            let target = target.clone();
            tokio::spawn(async move { manager.login(&target).await })
        });
        for login in futures::future::join_all(logins).await {
            assert_eq!(login.unwrap().unwrap().state(), SessionState::Active);
        }
        assert_eq!(fake.max_in_flight(), 1);
        // only the first login needed an exchange
        assert_eq!(fake.calls().login, 1);
        assert_eq!(manager.table().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn login_and_logout_on_one_target_are_serialized() {
        let fake = FakeInitiator::new();
        fake.set_delay(Duration::from_millis(100));
        let manager = Arc::new(manager(&fake, SessionConfig::default()));
        let target = target("10.0.0.1", "a");
        manager.login(&target).await.unwrap();

        let (login, logout) = tokio::join!(
            manager.apply(Operation::Login, &target),
            manager.apply(Operation::Logout, &target)
        );
        assert!(matches!(login.unwrap(), Outcome::Active(_)));
        assert!(matches!(logout.unwrap(), Outcome::LoggedOut));
        assert_eq!(fake.max_in_flight(), 1);
        assert!(manager.table().is_empty());
    }

    #[tokio::test]
    async fn apply_all_stops_on_shutdown() {
        let fake = FakeInitiator::new();
        let manager = manager(&fake, SessionConfig::default().with_max_concurrent_ops(1));
        let (signal, trigger) = ShutdownSignal::manual();
        trigger.trigger();

        let targets = vec![target("10.0.0.1", "a"), target("10.0.0.1", "b")];
        let outcomes = manager
            .apply_all(Operation::Login, targets.clone(), Some(&signal))
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(fake.calls().login, 0);

        let outcomes = manager.apply_all(Operation::Login, targets, None).await;
        let names = outcomes
            .iter()
            .map(|(target, _)| target.iqn())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["iqn.2024-01.io.example:a", "iqn.2024-01.io.example:b"]
        );
    }
}

use super::{Operation, Outcome, SessionManager};
use crate::{
    error::{self, Error, InitiatorError, SessionUnhealthy},
    initiator::with_timeout,
    portal::Portal,
    session::Session,
    store::LoginStart,
    target::{SessionKey, Target},
};
use indexmap::IndexMap;
use shutdown::ShutdownSignal;
use snafu::ResultExt;

/// Outcome of a login batch over the targets of one portal.
#[derive(Debug)]
pub struct LoginReport {
    /// The portal the targets were discovered on.
    pub portal: Portal,
    /// Sessions which are active.
    pub active: Vec<Session>,
    /// Target name to the cause of its failed login.
    pub failed: IndexMap<String, Error>,
    /// Targets which were not attempted as the shutdown was triggered.
    pub skipped: Vec<String>,
}

impl LoginReport {
    /// Log the outcome of every target.
    pub fn log(&self) {
        for (iqn, error) in &self.failed {
            tracing::error!(portal = %self.portal, iqn, %error, "Failed to log in to target");
        }
        for iqn in &self.skipped {
            tracing::warn!(portal = %self.portal, iqn, "Login skipped due to shutdown");
        }
        tracing::info!(
            portal = %self.portal,
            active = self.active.len(),
            failed = self.failed.len(),
            skipped = self.skipped.len(),
            "Login completed"
        );
    }
}

impl SessionManager {
    /// Log in to the target.
    ///
    /// An `Active` session is returned as is, without any exchange with the initiator.
    /// Otherwise the session goes through `LoggingIn`, ending up `Active` or, with the cause of
    /// the failure recorded, `Failed`. A login which leaves the session listed but not logged in
    /// on the initiator counts as failed.
    pub async fn login(&self, target: &Target) -> Result<Session, Error> {
        let key = target.key();
        let _guard = self.lock_target(&key).await;

        if let LoginStart::AlreadyActive(session) = self.table.begin_login(target)? {
            tracing::debug!(iqn = target.iqn(), portal = %target.portal(), "Session already active");
            return Ok(session);
        }

        let result = match with_timeout(
            "login",
            self.config.op_timeout(),
            self.initiator.login(target),
        )
        .await
        {
            Ok(()) => self.check_logged_in(target).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => self.table.finish_login(&key, None),
            Err(source) => {
                self.table.finish_login(&key, Some(source.to_string()))?;
                Err(source).context(error::Login {
                    portal: target.portal().clone(),
                    iqn: target.iqn(),
                })
            }
        }
    }

    /// Check the session of a successful login against the initiator's session listing.
    /// An existing session is accepted by the login exchange whatever its state, so a session
    /// which is listed but unhealthy fails the check. A listing failure is only logged.
    async fn check_logged_in(&self, target: &Target) -> Result<(), InitiatorError> {
        let key = target.key();
        let sessions = match with_timeout(
            "session listing",
            self.config.op_timeout(),
            self.initiator.sessions(),
        )
        .await
        {
            Ok(sessions) => sessions,
            Err(error) => {
                tracing::warn!(iqn = target.iqn(), portal = %target.portal(), %error, "Cannot check the session state after login");
                return Ok(());
            }
        };
        match sessions
            .iter()
            .find(|session| SessionKey::new(&session.portal, &session.iqn) == key)
        {
            Some(session) if !session.healthy => SessionUnhealthy {
                portal: target.portal().endpoint(),
                iqn: target.iqn(),
            }
            .fail(),
            _ => Ok(()),
        }
    }

    /// Log in to every target of the portal.
    /// Each target is attempted independently, failures are collected in the report.
    pub async fn login_all(
        &self,
        portal: &Portal,
        targets: Vec<Target>,
        shutdown: Option<&ShutdownSignal>,
    ) -> LoginReport {
        let mut skipped = targets
            .iter()
            .map(|t| t.iqn().to_string())
            .collect::<indexmap::IndexSet<_>>();

        let mut report = LoginReport {
            portal: portal.clone(),
            active: vec![],
            failed: IndexMap::new(),
            skipped: vec![],
        };
        for (target, outcome) in self.apply_all(Operation::Login, targets, shutdown).await {
            skipped.shift_remove(target.iqn());
            match outcome {
                Ok(Outcome::Active(session)) => report.active.push(session),
                Ok(_) => {}
                Err(error) => {
                    report.failed.insert(target.iqn().to_string(), error);
                }
            }
        }
        report.skipped = skipped.into_iter().collect();
        report
    }
}

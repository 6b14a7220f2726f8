use super::{Operation, Outcome, SessionManager};
use crate::{
    error::{self, Error},
    initiator::with_timeout,
    portal::Portal,
    target::Target,
};
use indexmap::{IndexMap, IndexSet};
use shutdown::ShutdownSignal;
use snafu::ResultExt;

/// Outcome of a logout batch over the targets of one portal.
#[derive(Debug)]
pub struct LogoutReport {
    /// The portal of the targets.
    pub portal: Portal,
    /// Targets whose session was torn down.
    pub logged_out: Vec<String>,
    /// Targets without a session on the initiator.
    pub untracked: Vec<String>,
    /// Target name to the cause of its failed logout.
    pub failed: IndexMap<String, Error>,
    /// Targets which were not attempted as the shutdown was triggered.
    pub skipped: Vec<String>,
}

impl LogoutReport {
    /// Log the outcome of every target.
    pub fn log(&self) {
        for (iqn, error) in &self.failed {
            tracing::error!(portal = %self.portal, iqn, %error, "Failed to log out from target");
        }
        for iqn in &self.skipped {
            tracing::warn!(portal = %self.portal, iqn, "Logout skipped due to shutdown");
        }
        tracing::info!(
            portal = %self.portal,
            logged_out = self.logged_out.len(),
            untracked = self.untracked.len(),
            failed = self.failed.len(),
            skipped = self.skipped.len(),
            "Logout completed"
        );
    }
}

impl SessionManager {
    /// Log out from the target, returning whether the initiator had a session to tear down.
    ///
    /// A tracked session goes through `LoggingOut` and is removed once logged out. On failure it
    /// is restored to the state it was in and the error is returned, the logout is not retried.
    /// The initiator is asked to log out even when no session is tracked, as it may hold one
    /// under another spelling of the portal. Having no session there is a trivial success.
    pub async fn logout(&self, target: &Target) -> Result<bool, Error> {
        let key = target.key();
        let _guard = self.lock_target(&key).await;

        let prior = self.table.begin_logout(&key)?;
        let result = with_timeout(
            "logout",
            self.config.op_timeout(),
            self.initiator.logout(target),
        )
        .await;

        let Some(prior) = prior else {
            let existed = result.context(error::Logout {
                portal: target.portal().clone(),
                iqn: target.iqn(),
            })?;
            if !existed {
                tracing::debug!(iqn = target.iqn(), portal = %target.portal(), "No session to log out from");
            }
            return Ok(existed);
        };
        match result {
            Ok(existed) => {
                self.table.finish_logout(&key, prior, None)?;
                Ok(existed)
            }
            Err(source) => {
                self.table
                    .finish_logout(&key, prior, Some(source.to_string()))?;
                Err(source).context(error::Logout {
                    portal: target.portal().clone(),
                    iqn: target.iqn(),
                })
            }
        }
    }

    /// Log out from every target of the portal.
    /// Each target is attempted independently, failures are collected in the report.
    pub async fn logout_all(
        &self,
        portal: &Portal,
        targets: Vec<Target>,
        shutdown: Option<&ShutdownSignal>,
    ) -> LogoutReport {
        let mut skipped = targets
            .iter()
            .map(|t| t.iqn().to_string())
            .collect::<IndexSet<_>>();

        let mut report = LogoutReport {
            portal: portal.clone(),
            logged_out: vec![],
            untracked: vec![],
            failed: IndexMap::new(),
            skipped: vec![],
        };
        for (target, outcome) in self.apply_all(Operation::Logout, targets, shutdown).await {
            let iqn = target.iqn().to_string();
            skipped.shift_remove(&iqn);
            match outcome {
                Ok(Outcome::LoggedOut) => report.logged_out.push(iqn),
                Ok(_) => report.untracked.push(iqn),
                Err(error) => {
                    report.failed.insert(iqn, error);
                }
            }
        }
        report.skipped = skipped.into_iter().collect();
        report
    }
}

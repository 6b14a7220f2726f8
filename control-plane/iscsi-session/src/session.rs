//! The state machine of a single initiator session.

use crate::{
    error::{Error, InvalidTransition},
    target::{SessionKey, Target},
};
use tokio::time::Instant;

/// Lifecycle state of a session.
///
/// ```text
/// Discovered -> LoggingIn -> Active -> Disconnected -> LoggingIn (retry)
/// LoggingIn -> Failed (-> LoggingIn on retry)
/// Active | Disconnected | Failed -> LoggingOut -> LoggedOut
/// ```
/// A failed logout returns the session to the state it was in before `LoggingOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::AsRefStr)]
pub enum SessionState {
    Discovered,
    LoggingIn,
    Active,
    Disconnected,
    LoggingOut,
    LoggedOut,
    Failed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Discovered | Disconnected | Failed, LoggingIn)
                | (LoggingIn, Active | Failed)
                | (Active, Disconnected)
                | (Active | Disconnected | Failed, LoggingOut)
                | (LoggingOut, LoggedOut | Active | Disconnected | Failed)
        )
    }
    /// A login or logout exchange is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::LoggingIn | Self::LoggingOut)
    }
    /// States from which a login is (re)driven.
    pub fn needs_login(self) -> bool {
        matches!(self, Self::Discovered | Self::Disconnected | Self::Failed)
    }
}

/// An initiator session to a target, as tracked by the session table.
#[derive(Debug, Clone)]
pub struct Session {
    target: Target,
    state: SessionState,
    last_error: Option<String>,
    /// Consecutive login attempts since the session was last `Active`.
    attempts: u32,
    last_attempt: Option<Instant>,
    /// When the current state was entered.
    since: Instant,
}

impl Session {
    /// A session to a freshly discovered target.
    pub(crate) fn discovered(target: Target) -> Self {
        Self::with_state(target, SessionState::Discovered)
    }
    /// A session which was established outside of our control.
    /// It is `Active` when logged in and `Disconnected` otherwise.
    pub(crate) fn adopted(target: Target, healthy: bool) -> Self {
        let state = if healthy {
            SessionState::Active
        } else {
            SessionState::Disconnected
        };
        Self::with_state(target, state)
    }
    fn with_state(target: Target, state: SessionState) -> Self {
        Self {
            target,
            state,
            last_error: None,
            attempts: 0,
            last_attempt: None,
            since: Instant::now(),
        }
    }

    /// The target of this session.
    pub fn target(&self) -> &Target {
        &self.target
    }
    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }
    /// The cause of the last failed login or logout, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
    /// Consecutive login attempts since the session was last `Active`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
    /// When the last login attempt started.
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }
    /// When the current state was entered.
    pub fn since(&self) -> Instant {
        self.since
    }
    /// Whether the session gave up on logging in after `max_attempts` failed attempts.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.state == SessionState::Failed && self.attempts >= max_attempts
    }
    /// The key of this session.
    pub fn key(&self) -> SessionKey {
        self.target.key()
    }

    /// Refresh the target information from a newer discovery.
    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = target;
    }

    /// Move to the `next` state, validating the transition.
    pub(crate) fn transition(&mut self, next: SessionState) -> Result<SessionState, Error> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return InvalidTransition {
                key: self.key(),
                from,
                to: next,
            }
            .fail();
        }
        self.state = next;
        self.since = Instant::now();
        match next {
            SessionState::LoggingIn => {
                self.attempts += 1;
                self.last_attempt = Some(self.since);
            }
            SessionState::Active => {
                self.attempts = 0;
                self.last_error = None;
            }
            _ => {}
        }
        tracing::info!(
            iqn = self.target.iqn(),
            portal = %self.target.portal(),
            %from,
            state = %next,
            "Session state transition"
        );
        Ok(from)
    }

    /// Record the cause of a failed exchange.
    pub(crate) fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::Portal;
    use SessionState::*;

    fn session() -> Session {
        Session::discovered(Target::new(
            "iqn.2024-01.io.example:a",
            Portal::new("10.0.0.1", None),
        ))
    }

    #[test]
    fn state_machine() {
        let all = [
            Discovered,
            LoggingIn,
            Active,
            Disconnected,
            LoggingOut,
            LoggedOut,
            Failed,
        ];
        // only these may enter LoggingIn
        let into_logging_in = all
            .iter()
            .filter(|s| s.can_transition_to(LoggingIn))
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(into_logging_in, vec![Discovered, Disconnected, Failed]);

        let into_logging_out = all
            .iter()
            .filter(|s| s.can_transition_to(LoggingOut))
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(into_logging_out, vec![Active, Disconnected, Failed]);

        // nothing skips the transitional states
        for from in all {
            if from != LoggingIn {
                assert!(!from.can_transition_to(Active) || from == LoggingOut, "{from}");
            }
            if from != LoggingOut {
                assert!(!from.can_transition_to(LoggedOut), "{from}");
            }
        }
        // LoggedOut is terminal
        assert!(all.iter().all(|s| !LoggedOut.can_transition_to(*s)));
    }

    #[test]
    fn transition_tracks_attempts() {
        let mut session = session();
        session.transition(LoggingIn).unwrap();
        assert_eq!(session.attempts(), 1);
        assert!(session.last_attempt().is_some());
        session.transition(Failed).unwrap();
        session.set_error("boom");
        session.transition(LoggingIn).unwrap();
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.last_error(), Some("boom"));

        session.transition(Active).unwrap();
        assert_eq!(session.attempts(), 0);
        assert_eq!(session.last_error(), None);
    }

    #[test]
    fn invalid_transition() {
        let mut session = session();
        let error = session.transition(Active).unwrap_err();
        assert!(matches!(
            error,
            Error::InvalidTransition {
                from: Discovered,
                to: Active,
                ..
            }
        ));
        assert_eq!(session.state(), Discovered);
        assert!(session.transition(LoggingOut).is_err());
    }
}

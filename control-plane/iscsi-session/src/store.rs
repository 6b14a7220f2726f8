//! The session table: the only shared mutable state of the session lifecycle.
//!
//! Entries are only ever modified through the state-transition methods below, each of which
//! applies its change under a single write lock, so readers always observe whole entries.
//! Protocol exchanges for the same target are additionally serialized by a per-target async
//! lock (see [`SessionTable::target_lock`]), which is held across the exchange.

use crate::{
    error::{Error, NotTracked},
    portal::Portal,
    session::{Session, SessionState},
    target::{SessionKey, Target},
};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use snafu::OptionExt;
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;

/// Result of starting a login.
#[derive(Debug)]
pub(crate) enum LoginStart {
    /// The session moved to `LoggingIn`, the exchange must be driven.
    Started,
    /// The session is already active, nothing to do.
    AlreadyActive(Session),
}

/// Counts of sessions per state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub discovered: usize,
    pub in_progress: usize,
    pub active: usize,
    pub disconnected: usize,
    pub failed: usize,
    /// Failed sessions which reached the maximum number of login attempts.
    pub exhausted: usize,
}

/// Table of all tracked sessions, keyed by (portal endpoint, target name).
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<IndexMap<SessionKey, Session>>,
    locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionTable {
    /// Return a new empty `Self`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock which serializes the protocol exchanges for the given session.
    pub(crate) fn target_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }
    /// Drop the locks which are neither in use nor belong to a tracked session.
    pub(crate) fn prune_locks(&self) {
        let sessions = self.sessions.read();
        self.locks
            .lock()
            .retain(|key, lock| Arc::strong_count(lock) > 1 || sessions.contains_key(key));
    }
    /// Check whether an exchange for the given session is queued or in flight.
    pub(crate) fn is_busy(&self, key: &SessionKey) -> bool {
        self.locks
            .lock()
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Get a copy of the session with the given key.
    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.read().get(key).cloned()
    }
    /// Consistent copy of all sessions, in tracking order.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }
    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
    /// Distinct portals of the tracked sessions, in tracking order.
    pub fn portals(&self) -> Vec<Portal> {
        let sessions = self.sessions.read();
        let mut endpoints = IndexSet::new();
        sessions
            .values()
            .map(|s| s.target().portal())
            .filter(|p| endpoints.insert(p.endpoint()))
            .cloned()
            .collect()
    }
    /// Count the sessions per state.
    pub fn summary(&self, max_attempts: u32) -> SessionSummary {
        let sessions = self.sessions.read();
        sessions
            .values()
            .fold(SessionSummary::default(), |mut summary, session| {
                match session.state() {
                    SessionState::Discovered => summary.discovered += 1,
                    SessionState::LoggingIn | SessionState::LoggingOut => summary.in_progress += 1,
                    SessionState::Active => summary.active += 1,
                    SessionState::Disconnected => summary.disconnected += 1,
                    SessionState::Failed => {
                        summary.failed += 1;
                        if session.is_exhausted(max_attempts) {
                            summary.exhausted += 1;
                        }
                    }
                    SessionState::LoggedOut => {}
                }
                summary
            })
    }

    /// Track a discovered target, returning the state of its session.
    /// Existing sessions keep their state, only the target information is refreshed.
    pub(crate) fn track_discovered(&self, target: &Target) -> SessionState {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&target.key()) {
            Some(session) => {
                session.set_target(target.clone());
                session.state()
            }
            None => {
                tracing::debug!(iqn = target.iqn(), portal = %target.portal(), "Tracking discovered target");
                sessions.insert(target.key(), Session::discovered(target.clone()));
                SessionState::Discovered
            }
        }
    }

    /// Track a session which exists on the initiator but is not yet known to us.
    /// Unhealthy sessions are tracked as `Disconnected`, so they can still be logged out from.
    /// Returns false if the session was already tracked.
    pub(crate) fn adopt(&self, target: Target, healthy: bool) -> bool {
        let mut sessions = self.sessions.write();
        let key = target.key();
        if sessions.contains_key(&key) {
            return false;
        }
        tracing::info!(iqn = target.iqn(), portal = %target.portal(), healthy, "Adopting live session");
        sessions.insert(key, Session::adopted(target, healthy));
        true
    }

    /// Start a login, creating the session if the target is not tracked yet.
    pub(crate) fn begin_login(&self, target: &Target) -> Result<LoginStart, Error> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(target.key())
            .or_insert_with(|| Session::discovered(target.clone()));
        if session.state() == SessionState::Active {
            return Ok(LoginStart::AlreadyActive(session.clone()));
        }
        session.transition(SessionState::LoggingIn)?;
        Ok(LoginStart::Started)
    }

    /// Complete a login started with `begin_login`.
    pub(crate) fn finish_login(
        &self,
        key: &SessionKey,
        error: Option<String>,
    ) -> Result<Session, Error> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(key)
            .context(NotTracked { key: key.clone() })?;
        match error {
            None => {
                session.transition(SessionState::Active)?;
            }
            Some(error) => {
                session.transition(SessionState::Failed)?;
                session.set_error(error);
            }
        }
        Ok(session.clone())
    }

    /// Start a logout, returning the state the session was in.
    /// None means there is no session to log out from.
    pub(crate) fn begin_logout(&self, key: &SessionKey) -> Result<Option<SessionState>, Error> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(key) {
            None => Ok(None),
            // never logged in, nothing to tear down
            Some(session) if session.state() == SessionState::Discovered => Ok(None),
            Some(session) => session.transition(SessionState::LoggingOut).map(Some),
        }
    }

    /// Complete a logout started with `begin_logout`.
    /// On success the session is removed, otherwise it returns to its `prior` state.
    pub(crate) fn finish_logout(
        &self,
        key: &SessionKey,
        prior: SessionState,
        error: Option<String>,
    ) -> Result<(), Error> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(key)
            .context(NotTracked { key: key.clone() })?;
        match error {
            None => {
                session.transition(SessionState::LoggedOut)?;
                sessions.shift_remove(key);
            }
            Some(error) => {
                session.transition(prior)?;
                session.set_error(error);
            }
        }
        Ok(())
    }

    /// Mark an active session as disconnected, unless it became active after `observed_at`.
    /// Returns true if the session was marked.
    pub(crate) fn mark_disconnected(&self, key: &SessionKey, observed_at: Instant) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(key) {
            Some(session)
                if session.state() == SessionState::Active && session.since() <= observed_at =>
            {
                session.transition(SessionState::Disconnected).is_ok()
            }
            _ => false,
        }
    }

    /// Mark a `Disconnected` or `Failed` session as active again, as it was found logged in on
    /// the initiator. The session goes through `LoggingIn`, which resets its attempts.
    /// Sessions which changed state after `observed_at` are left alone.
    /// Returns true if the session was recovered.
    pub(crate) fn mark_recovered(&self, key: &SessionKey, observed_at: Instant) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(key) {
            Some(session)
                if matches!(
                    session.state(),
                    SessionState::Disconnected | SessionState::Failed
                ) && session.since() <= observed_at =>
            {
                session.transition(SessionState::LoggingIn).is_ok()
                    && session.transition(SessionState::Active).is_ok()
            }
            _ => false,
        }
    }
}

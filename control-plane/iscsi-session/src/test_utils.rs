//! Scripted in-memory initiator used by the unit tests.

use crate::{
    error::{CommandFailed, InitiatorError},
    initiator::{Initiator, LiveSession},
    portal::Portal,
    probe::ConnectivityProbe,
    target::{SessionKey, Target},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// Number of calls per initiator operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Calls {
    pub(crate) discover: usize,
    pub(crate) login: usize,
    pub(crate) logout: usize,
    pub(crate) sessions: usize,
}

#[derive(Debug, Default)]
struct State {
    exports: HashMap<String, Vec<String>>,
    unreachable: HashSet<String>,
    /// Remaining failures per target name.
    login_failures: HashMap<String, u32>,
    logout_failures: HashSet<String>,
    live: IndexMap<SessionKey, LiveSession>,
    /// Sessions which stay unhealthy, even across logins.
    unhealthy: HashSet<SessionKey>,
    delay: Duration,
    calls: Calls,
    in_flight: HashMap<SessionKey, usize>,
    max_in_flight: usize,
}

/// An [`Initiator`] and [`ConnectivityProbe`] backed by scripted behaviour.
/// Sessions which log in successfully become live and, unless set unhealthy, healthy.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeInitiator {
    state: Arc<Mutex<State>>,
}

/// Tracks an exchange on a target for as long as it is in flight.
struct InFlight {
    state: Arc<Mutex<State>>,
    key: SessionKey,
}

impl InFlight {
    fn new(state: &Arc<Mutex<State>>, key: SessionKey) -> Self {
        let mut locked = state.lock();
        let count = locked.in_flight.entry(key.clone()).or_default();
        *count += 1;
        let count = *count;
        locked.max_in_flight = locked.max_in_flight.max(count);
        Self {
            state: state.clone(),
            key,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(count) = self.state.lock().in_flight.get_mut(&self.key) {
            *count -= 1;
        }
    }
}

impl FakeInitiator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make the portal at `address` export the given targets.
    pub(crate) fn export(&self, address: &str, targets: &[&str]) {
        self.state.lock().exports.insert(
            address.to_string(),
            targets.iter().map(ToString::to_string).collect(),
        );
    }
    /// Make the portal at `address` unreachable.
    pub(crate) fn set_unreachable(&self, address: &str) {
        self.state.lock().unreachable.insert(address.to_string());
    }
    /// Make the next `times` logins to the target fail.
    pub(crate) fn fail_login(&self, iqn: &str, times: u32) {
        self.state
            .lock()
            .login_failures
            .insert(iqn.to_string(), times);
    }
    /// Make every logout from the target fail.
    pub(crate) fn fail_logout(&self, iqn: &str) {
        self.state.lock().logout_failures.insert(iqn.to_string());
    }
    /// Delay every exchange by `delay`.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }
    /// Add a session which was established out of band.
    pub(crate) fn add_live(&self, portal: &Portal, iqn: &str, healthy: bool) {
        self.state.lock().live.insert(
            SessionKey::new(portal, iqn),
            LiveSession {
                portal: portal.clone(),
                iqn: iqn.to_string(),
                healthy,
            },
        );
    }
    /// Make the live session to the target unhealthy until the end of the test.
    /// Logging in again, which succeeds as the session exists, doesn't heal it.
    pub(crate) fn set_unhealthy(&self, portal: &Portal, iqn: &str) {
        let key = SessionKey::new(portal, iqn);
        let mut state = self.state.lock();
        state.unhealthy.insert(key.clone());
        state.live.insert(
            key,
            LiveSession {
                portal: portal.clone(),
                iqn: iqn.to_string(),
                healthy: false,
            },
        );
    }
    /// Drop the live session to the target, as if the connection was lost.
    pub(crate) fn drop_session(&self, portal: &Portal, iqn: &str) {
        self.state
            .lock()
            .live
            .shift_remove(&SessionKey::new(portal, iqn));
    }
    /// Keys of the live sessions.
    pub(crate) fn live_sessions(&self) -> Vec<SessionKey> {
        self.state.lock().live.keys().cloned().collect()
    }
    /// Calls made so far.
    pub(crate) fn calls(&self) -> Calls {
        self.state.lock().calls
    }
    /// Highest number of overlapping exchanges observed on a single target.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    async fn delay(&self) {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn failed(operation: &str, stderr: &str) -> InitiatorError {
        CommandFailed {
            binary: "fake",
            operation,
            code: Some(1),
            stderr,
        }
        .build()
    }
}

#[async_trait::async_trait]
impl Initiator for FakeInitiator {
    async fn discover(&self, portal: &Portal) -> Result<Vec<String>, InitiatorError> {
        let exports = {
            let mut state = self.state.lock();
            state.calls.discover += 1;
            if state.unreachable.contains(portal.address()) {
                return Err(Self::failed("discovery", "no route to host"));
            }
            state.exports.get(portal.address()).cloned()
        };
        self.delay().await;
        Ok(exports.unwrap_or_default())
    }

    async fn login(&self, target: &Target) -> Result<(), InitiatorError> {
        let _in_flight = InFlight::new(&self.state, target.key());
        self.state.lock().calls.login += 1;
        self.delay().await;

        let mut state = self.state.lock();
        if let Some(remaining) = state.login_failures.get_mut(target.iqn()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Self::failed("login", "authentication failure"));
            }
        }
        let healthy = !state.unhealthy.contains(&target.key());
        state.live.insert(
            target.key(),
            LiveSession {
                portal: target.portal().clone(),
                iqn: target.iqn().to_string(),
                healthy,
            },
        );
        Ok(())
    }

    async fn logout(&self, target: &Target) -> Result<bool, InitiatorError> {
        let _in_flight = InFlight::new(&self.state, target.key());
        self.state.lock().calls.logout += 1;
        self.delay().await;

        let mut state = self.state.lock();
        if state.logout_failures.contains(target.iqn()) {
            return Err(Self::failed("logout", "device busy"));
        }
        Ok(state.live.shift_remove(&target.key()).is_some())
    }

    async fn sessions(&self) -> Result<Vec<LiveSession>, InitiatorError> {
        let mut state = self.state.lock();
        state.calls.sessions += 1;
        Ok(state.live.values().cloned().collect())
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for FakeInitiator {
    async fn probe(&self, candidates: &[String], _port: Option<u16>) -> Option<String> {
        let state = self.state.lock();
        candidates
            .iter()
            .find(|candidate| !state.unreachable.contains(candidate.as_str()))
            .cloned()
    }
}

//! Cooperative shutdown signalling.
//!
//! A [`ShutdownSignal`] is a cheap, clonable handle which long running loops hold on to.
//! They can either await on [`ShutdownSignal::wait`] or poll [`ShutdownSignal::is_triggered`]
//! in between units of work, so that a shutdown request stops new work from being scheduled
//! while the work already in flight is allowed to complete.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{signal::unix::SignalKind, sync::oneshot};

/// What caused the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A unix signal was received.
    Signal(SignalKind),
    /// Shutdown was requested programmatically through a [`ShutdownTrigger`].
    Requested,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(kind) if *kind == SignalKind::interrupt() => write!(f, "SIGINT"),
            Self::Signal(kind) if *kind == SignalKind::terminate() => write!(f, "SIGTERM"),
            Self::Signal(kind) => write!(f, "signal {}", kind.as_raw_value()),
            Self::Requested => write!(f, "requested"),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Listeners awaiting for the shutdown.
    listeners: Vec<oneshot::Sender<ShutdownReason>>,
    /// Set once the shutdown has been triggered.
    reason: Option<ShutdownReason>,
}

/// Shutdown signal handle.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

impl ShutdownSignal {
    /// Get the process-wide signal which fires on SIGINT or SIGTERM.
    /// The first call must be made from within a tokio runtime as it schedules the task which
    /// listens for the unix signals.
    pub fn int_term() -> Self {
        lazy_static! {
            static ref TERM: ShutdownSignal = ShutdownSignal::from_event(IntTermEvent {});
        }
        TERM.clone()
    }

    /// Get a signal which is only fired through the returned trigger.
    pub fn manual() -> (Self, ShutdownTrigger) {
        let signal = Self::default();
        let trigger = ShutdownTrigger {
            signal: signal.clone(),
        };
        (signal, trigger)
    }

    /// Get a signal fired when the given event completes.
    fn from_event(event: impl ShutdownEvent + 'static) -> Self {
        let signal = Self::default();
        let task_signal = signal.clone();
        tokio::spawn(async move {
            let kind = event.wait().await;
            task_signal.trigger(ShutdownReason::Signal(kind));
        });
        signal
    }

    /// Fire the signal, notifying all current listeners.
    /// Only the first trigger is recorded.
    fn trigger(&self, reason: ShutdownReason) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.reason.is_some() {
                return;
            }
            inner.reason = Some(reason);
            std::mem::take(&mut inner.listeners)
        };
        for sender in listeners {
            // It's ok if the receiver has already been dropped.
            sender.send(reason).ok();
        }
    }

    /// Check whether the shutdown has already been triggered.
    pub fn is_triggered(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    /// The reason of the shutdown, if it has been triggered.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.lock().reason
    }

    /// Returns a future that completes when the shutdown has been triggered.
    /// The future completes immediately if the shutdown had already been triggered.
    /// None is returned if every handle to the signal has been dropped without triggering it.
    pub fn wait(&self) -> impl Future<Output = Option<ShutdownReason>> {
        let chan = {
            let mut inner = self.inner.lock();
            match inner.reason {
                Some(reason) => Err(reason),
                None => {
                    let (send, receive) = oneshot::channel();
                    inner.listeners.push(send);
                    Ok(receive)
                }
            }
        };
        async move {
            match chan {
                Ok(wait) => wait.await.ok(),
                Err(reason) => Some(reason),
            }
        }
    }
}

/// Fires a [`ShutdownSignal`] created with [`ShutdownSignal::manual`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    signal: ShutdownSignal,
}

impl ShutdownTrigger {
    /// Request the shutdown.
    pub fn trigger(&self) {
        self.signal.trigger(ShutdownReason::Requested);
    }
}

/// Internal event which returns the signal that triggered it.
#[async_trait::async_trait]
trait ShutdownEvent: Send + Sync {
    async fn wait(&self) -> SignalKind;
}

/// Shutdown Event when INT | TERM are received.
struct IntTermEvent {}
#[async_trait::async_trait]
impl ShutdownEvent for IntTermEvent {
    async fn wait(&self) -> SignalKind {
        let mut sig_int =
            tokio::signal::unix::signal(SignalKind::interrupt()).expect("to register SIGINT");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("to register SIGTERM");

        tokio::select! {
            _ = sig_int.recv() => {
                tracing::warn!(signal = %ShutdownReason::Signal(SignalKind::interrupt()), "Signalled");
                SignalKind::interrupt()
            },
            _ = sig_term.recv() => {
                tracing::warn!(signal = %ShutdownReason::Signal(SignalKind::terminate()), "Signalled");
                SignalKind::terminate()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct TestEvent {}
    #[async_trait::async_trait]
    impl ShutdownEvent for TestEvent {
        async fn wait(&self) -> SignalKind {
            SignalKind::alarm()
        }
    }

    #[tokio::test]
    async fn event_fires_signal() {
        let signal = ShutdownSignal::from_event(TestEvent {});
        assert_eq!(
            signal.wait().await,
            Some(ShutdownReason::Signal(SignalKind::alarm()))
        );
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn manual_trigger_wakes_all_listeners() {
        let (signal, trigger) = ShutdownSignal::manual();
        let first = tokio::spawn(signal.wait());
        let second = tokio::spawn(signal.clone().wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_triggered());

        trigger.trigger();
        assert_eq!(first.await.unwrap(), Some(ShutdownReason::Requested));
        assert_eq!(second.await.unwrap(), Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn wait_after_trigger_is_immediate() {
        let (signal, trigger) = ShutdownSignal::manual();
        trigger.trigger();
        // a second trigger doesn't change the recorded reason
        signal.trigger(ShutdownReason::Signal(SignalKind::terminate()));
        assert_eq!(signal.reason(), Some(ShutdownReason::Requested));
        assert_eq!(signal.wait().await, Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn dropped_without_trigger() {
        let (signal, trigger) = ShutdownSignal::manual();
        let wait = signal.wait();
        drop(signal);
        drop(trigger);
        assert_eq!(wait.await, None);
    }
}

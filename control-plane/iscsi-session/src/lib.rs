//! iSCSI initiator session lifecycle management.
//!
//! Portals are parsed into a [`portal::PortalSet`], expanded into their exported targets by the
//! [`discovery::TargetDiscoverer`] and logged in to, or out from, by the
//! [`manager::SessionManager`], which tracks every session in a shared [`store::SessionTable`].
//! The [`watcher::SessionWatcher`] keeps the tracked sessions alive until it's shut down.

pub mod config;
pub mod discovery;
pub mod error;
pub mod initiator;
pub mod manager;
pub mod operations;
pub mod portal;
pub mod probe;
pub mod session;
pub mod store;
pub mod target;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::SessionConfig;
pub use error::{Error, InitiatorError};
pub use manager::SessionManager;
pub use portal::{Portal, PortalSet};
pub use watcher::SessionWatcher;

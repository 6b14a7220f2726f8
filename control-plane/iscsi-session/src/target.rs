//! Targets exported by portals and the keys of their sessions.

use crate::{
    error::{InitiatorError, InvalidTarget},
    portal::Portal,
};
use chrono::{DateTime, Utc};
use regex::Regex;

lazy_static::lazy_static! {
    /// iqn.yyyy-mm.naming-authority[:unique], eui.<16 hex> or naa.<16|32 hex>.
    static ref TARGET_NAME_REGEX: Regex = Regex::new(
        r"^(iqn\.\d{4}-\d{2}\.[A-Za-z0-9][A-Za-z0-9.\-]*(:[^\s]+)?|eui\.[0-9A-Fa-f]{16}|naa\.[0-9A-Fa-f]{16}([0-9A-Fa-f]{16})?)$"
    )
    .unwrap();
}

/// Validate an iSCSI target name.
pub fn validate_target_name(name: &str) -> Result<(), InitiatorError> {
    if name.len() > 223 || !TARGET_NAME_REGEX.is_match(name) {
        return InvalidTarget { name }.fail();
    }
    Ok(())
}

/// An iSCSI target exported by a portal.
/// Targets are recreated on every discovery pass.
#[derive(Debug, Clone)]
pub struct Target {
    iqn: String,
    portal: Portal,
    discovered_at: DateTime<Utc>,
}

impl Target {
    /// Return a new `Self`, discovered now.
    pub fn new(iqn: impl Into<String>, portal: Portal) -> Self {
        Self {
            iqn: iqn.into(),
            portal,
            discovered_at: Utc::now(),
        }
    }
    /// The target name.
    pub fn iqn(&self) -> &str {
        &self.iqn
    }
    /// The portal through which the target was discovered.
    pub fn portal(&self) -> &Portal {
        &self.portal
    }
    /// When the target was discovered.
    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }
    /// Key of the session to this target.
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.portal, &self.iqn)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.iqn, self.portal)
    }
}

/// Identifies a session: one per (portal endpoint, target name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    endpoint: String,
    iqn: String,
}

impl SessionKey {
    /// Return a new `Self` for the given portal and target.
    pub fn new(portal: &Portal, iqn: &str) -> Self {
        Self {
            endpoint: portal.endpoint(),
            iqn: iqn.to_string(),
        }
    }
    /// The portal endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
    /// The target name.
    pub fn iqn(&self) -> &str {
        &self.iqn
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.iqn, self.endpoint)
    }
}

//! Target discovery over the `SendTargets` exchange.

use crate::{
    error::{self, Error, InitiatorError},
    initiator::{with_timeout, Initiator},
    portal::Portal,
    probe::ConnectivityProbe,
    target::{validate_target_name, Target},
};
use futures::future::join_all;
use indexmap::IndexSet;
use snafu::ResultExt;
use std::{sync::Arc, time::Duration};

/// Expands portals into the targets they export.
#[derive(Clone)]
pub struct TargetDiscoverer {
    initiator: Arc<dyn Initiator>,
    probe: Arc<dyn ConnectivityProbe>,
    timeout: Duration,
}

impl std::fmt::Debug for TargetDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetDiscoverer")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TargetDiscoverer {
    /// Return a new `Self` which bounds each discovery exchange by `timeout`.
    pub fn new(
        initiator: Arc<dyn Initiator>,
        probe: Arc<dyn ConnectivityProbe>,
        timeout: Duration,
    ) -> Self {
        Self {
            initiator,
            probe,
            timeout,
        }
    }

    /// Query the portal for its targets.
    /// Unreachable portals fail without a discovery exchange. Target names are validated and
    /// duplicates collapsed, keeping the reply order.
    pub async fn discover(&self, portal: &Portal) -> Result<Vec<Target>, Error> {
        self.discover_names(portal)
            .await
            .map(|names| {
                names
                    .into_iter()
                    .map(|iqn| Target::new(iqn, portal.clone()))
                    .collect::<Vec<_>>()
            })
            .context(error::Discovery {
                portal: portal.clone(),
            })
            .map(|targets| {
                tracing::debug!(portal = %portal, targets = targets.len(), "Discovered targets");
                targets
            })
    }

    async fn discover_names(&self, portal: &Portal) -> Result<IndexSet<String>, InitiatorError> {
        let candidates = [portal.address().to_string()];
        if self.probe.probe(&candidates, portal.port()).await.is_none() {
            return error::Unreachable {
                portal: portal.endpoint(),
            }
            .fail();
        }

        let names = with_timeout(
            "discovery",
            self.timeout,
            self.initiator.discover(portal),
        )
        .await?;

        let mut unique = IndexSet::with_capacity(names.len());
        for name in names {
            validate_target_name(&name)?;
            unique.insert(name);
        }
        Ok(unique)
    }

    /// Discover all portals concurrently.
    /// Each portal gets its own outcome, a failing portal does not affect its siblings.
    pub async fn discover_all<'a>(
        &self,
        portals: impl IntoIterator<Item = &'a Portal>,
    ) -> Vec<(Portal, Result<Vec<Target>, Error>)> {
        join_all(portals.into_iter().map(|portal| async move {
            (portal.clone(), self.discover(portal).await)
        }))
        .await
    }
}

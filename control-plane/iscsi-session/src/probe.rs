//! Reachability checks of portal addresses.

use crate::portal::join_host_port;
use std::time::Duration;
use tokio::net::TcpStream;
use utils::ISCSI_DEFAULT_PORT;

/// Finds a reachable address among a set of candidates.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Return the first of the `candidates` which accepts a connection on `port`, or the default
    /// iSCSI port if `port` is None.
    /// Unreachable candidates are skipped, None means that none is reachable.
    async fn probe(&self, candidates: &[String], port: Option<u16>) -> Option<String>;
}

/// Probes candidates with a plain TCP connect.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Return a new `Self` which gives each candidate up to `timeout` to accept.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, endpoint: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(endpoint)).await {
            // the stream is closed as it goes out of scope
            Ok(Ok(_stream)) => true,
            Ok(Err(error)) => {
                tracing::trace!(endpoint, %error, "Candidate refused the connection");
                false
            }
            Err(_) => {
                tracing::trace!(endpoint, timeout=?self.timeout, "Candidate connection timed out");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self, candidates: &[String], port: Option<u16>) -> Option<String> {
        let port = port.unwrap_or(ISCSI_DEFAULT_PORT);
        for candidate in candidates {
            if self.connect(&join_host_port(candidate, port)).await {
                return Some(candidate.clone());
            }
        }
        None
    }
}

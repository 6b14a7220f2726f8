//! [`Initiator`] implementation driving the open-iscsi `iscsiadm` tool.

use super::{Initiator, LiveSession};
use crate::{
    error::{BinaryNotFound, CommandFailed, InitiatorError, MalformedOutput, Spawn},
    portal::Portal,
    target::Target,
};
use snafu::ResultExt;
use std::{path::PathBuf, process::Output, str::FromStr};
use tokio::process::Command;
use tracing::{debug, trace};
use utils::{ISCSIADM_BINARY, ISCSI_SESSION_SYSFS_CLASS};

/// `ISCSI_ERR_SESS_EXISTS`: a session to the target is already logged in.
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `ISCSI_ERR_NO_OBJS_FOUND`: no matching session or node record.
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;
/// Sysfs session state of a logged in session.
const SESSION_LOGGED_IN: &str = "LOGGED_IN";

/// Drives the host initiator through `iscsiadm`.
#[derive(Debug, Clone)]
pub struct IscsiAdm {
    binary: PathBuf,
    sysfs_class: PathBuf,
}

impl IscsiAdm {
    /// Use the given binary, or look up `iscsiadm` in the `PATH`.
    pub fn new(binary: Option<PathBuf>) -> Result<Self, InitiatorError> {
        let binary = match binary {
            Some(binary) => binary,
            None => which::which(ISCSIADM_BINARY).context(BinaryNotFound {
                binary: ISCSIADM_BINARY,
            })?,
        };
        Ok(Self {
            binary,
            sysfs_class: PathBuf::from(ISCSI_SESSION_SYSFS_CLASS),
        })
    }
    /// Read the session states from the given sysfs class directory.
    pub fn with_sysfs_class(self, sysfs_class: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_class: sysfs_class.into(),
            ..self
        }
    }

    fn binary_name(&self) -> String {
        self.binary.to_string_lossy().to_string()
    }

    /// Run iscsiadm, returning its output regardless of the exit status.
    async fn run(&self, args: &[&str]) -> Result<Output, InitiatorError> {
        debug!(binary = %self.binary.display(), ?args, "Executing");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .context(Spawn {
                binary: self.binary_name(),
            })?;
        trace!(
            status = ?output.status.code(),
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Output from {}",
            self.binary_name()
        );
        Ok(output)
    }

    /// Map a non-zero exit status, other than the `accepted` ones, into an error.
    fn ack_output(
        &self,
        operation: &str,
        output: &Output,
        accepted: &[i32],
    ) -> Result<(), InitiatorError> {
        if output.status.success() {
            return Ok(());
        }
        match output.status.code() {
            Some(code) if accepted.contains(&code) => Ok(()),
            code => CommandFailed {
                binary: self.binary_name(),
                operation,
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim(),
            }
            .fail(),
        }
    }

    /// Check the kernel state of the session with the given id.
    /// A session whose state can't be read is reported healthy as iscsiadm listed it.
    async fn session_healthy(&self, sid: u32) -> bool {
        let path = self
            .sysfs_class
            .join(format!("session{sid}"))
            .join("state");
        match tokio::fs::read_to_string(&path).await {
            Ok(state) => state.trim() == SESSION_LOGGED_IN,
            Err(error) => {
                trace!(path = %path.display(), %error, "Cannot read the session state");
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl Initiator for IscsiAdm {
    async fn discover(&self, portal: &Portal) -> Result<Vec<String>, InitiatorError> {
        let endpoint = portal.endpoint();
        let output = self
            .run(&["-m", "discovery", "-t", "sendtargets", "-p", &endpoint])
            .await?;
        self.ack_output("discovery", &output, &[])?;
        parse_discovery(&String::from_utf8_lossy(&output.stdout))
    }

    async fn login(&self, target: &Target) -> Result<(), InitiatorError> {
        let endpoint = target.portal().endpoint();
        let output = self
            .run(&["-m", "node", "-T", target.iqn(), "-p", &endpoint, "--login"])
            .await?;
        self.ack_output("login", &output, &[ISCSI_ERR_SESS_EXISTS])
    }

    async fn logout(&self, target: &Target) -> Result<bool, InitiatorError> {
        let endpoint = target.portal().endpoint();
        let output = self
            .run(&["-m", "node", "-T", target.iqn(), "-p", &endpoint, "--logout"])
            .await?;
        if output.status.code() == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            return Ok(false);
        }
        self.ack_output("logout", &output, &[])?;
        Ok(true)
    }

    async fn sessions(&self) -> Result<Vec<LiveSession>, InitiatorError> {
        let output = self.run(&["-m", "session"]).await?;
        if output.status.code() == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            return Ok(vec![]);
        }
        self.ack_output("session listing", &output, &[])?;

        let mut sessions = vec![];
        for record in parse_sessions(&String::from_utf8_lossy(&output.stdout))? {
            sessions.push(LiveSession {
                healthy: self.session_healthy(record.sid).await,
                portal: record.portal,
                iqn: record.iqn,
            });
        }
        Ok(sessions)
    }
}

/// Parse a `<address>:<port>,<tpgt>` portal as printed by iscsiadm.
fn parse_portal_tpgt(value: &str) -> Option<Portal> {
    let (portal, tpgt) = value.rsplit_once(',')?;
    tpgt.parse::<u32>().ok()?;
    Portal::from_str(portal).ok()
}

/// Parse the sendtargets discovery output, one `<portal>,<tpgt> <target>` record per line.
fn parse_discovery(stdout: &str) -> Result<Vec<String>, InitiatorError> {
    let malformed = |line: &str| {
        MalformedOutput {
            operation: "discovery",
            line,
        }
        .build()
    };
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [portal, name] if parse_portal_tpgt(portal).is_some() => Ok(name.to_string()),
            _ => Err(malformed(line)),
        })
        .collect()
}

/// A session record from the session listing.
#[derive(Debug, PartialEq)]
struct SessionRecord {
    sid: u32,
    portal: Portal,
    iqn: String,
}

/// Parse the session listing, one
/// `<transport>: [<sid>] <portal>,<tpgt> <target> (non-flash)` record per line.
fn parse_sessions(stdout: &str) -> Result<Vec<SessionRecord>, InitiatorError> {
    let malformed = |line: &str| {
        MalformedOutput {
            operation: "session listing",
            line,
        }
        .build()
    };
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let tokens = line.split_whitespace().collect::<Vec<_>>();
            let [_transport, sid, portal, iqn, ..] = tokens.as_slice() else {
                return Err(malformed(line));
            };
            let sid = sid
                .strip_prefix('[')
                .and_then(|sid| sid.strip_suffix(']'))
                .and_then(|sid| sid.parse::<u32>().ok())
                .ok_or_else(|| malformed(line))?;
            let portal = parse_portal_tpgt(portal).ok_or_else(|| malformed(line))?;
            Ok(SessionRecord {
                sid,
                portal,
                iqn: iqn.to_string(),
            })
        })
        .collect()
}

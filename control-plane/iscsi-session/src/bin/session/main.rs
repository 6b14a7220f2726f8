use clap::Parser;
use iscsi_session::{
    initiator::{iscsiadm::IscsiAdm, Initiator},
    probe::{ConnectivityProbe, TcpProbe},
    store::SessionTable,
    PortalSet, SessionConfig, SessionManager, SessionWatcher,
};
use shutdown::ShutdownSignal;
use std::{path::PathBuf, sync::Arc};
use utils::{
    tracing_telemetry::{FmtStyle, TracingTelemetry},
    ISCSI_MAX_CONCURRENT_OPS, ISCSI_MAX_LOGIN_ATTEMPTS, ISCSI_MAX_RETRY_BACKOFF,
    ISCSI_OP_TIMEOUT, ISCSI_PROBE_TIMEOUT, ISCSI_RETRY_BACKOFF, ISCSI_WATCH_PERIOD,
};

/// The Cli arguments for this binary.
#[derive(Debug, Parser)]
#[clap(name = utils::package_description!(), version)]
struct CliArgs {
    /// The operation to be performed.
    #[clap(subcommand)]
    command: Command,

    /// Path to the iscsiadm binary, looked up in the PATH by default.
    #[clap(global = true, long)]
    iscsiadm: Option<PathBuf>,

    /// Timeout for a single discovery, login or logout exchange.
    #[clap(global = true, long, default_value = ISCSI_OP_TIMEOUT)]
    op_timeout: humantime::Duration,

    /// Timeout for the portal connectivity probe.
    #[clap(global = true, long, default_value = ISCSI_PROBE_TIMEOUT)]
    probe_timeout: humantime::Duration,

    /// Period of the watch loop.
    #[clap(global = true, long, default_value = ISCSI_WATCH_PERIOD)]
    watch_period: humantime::Duration,

    /// Login attempts after which the watch loop leaves a session failed.
    #[clap(global = true, long, default_value_t = ISCSI_MAX_LOGIN_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    max_login_attempts: u32,

    /// Backoff after the first failed login attempt, doubled on every further failure.
    #[clap(global = true, long, default_value = ISCSI_RETRY_BACKOFF)]
    retry_backoff: humantime::Duration,

    /// Upper bound of the backoff between login attempts.
    #[clap(global = true, long, default_value = ISCSI_MAX_RETRY_BACKOFF)]
    max_retry_backoff: humantime::Duration,

    /// Maximum number of concurrent login or logout exchanges.
    #[clap(global = true, long, default_value_t = ISCSI_MAX_CONCURRENT_OPS)]
    max_concurrent_ops: usize,

    /// Formatting style to be used while logging.
    #[clap(global = true, long, default_value = FmtStyle::Pretty.as_ref())]
    fmt_style: FmtStyle,

    /// Use ANSI colors for the logs.
    #[clap(global = true, long, default_value_t = true, action = clap::ArgAction::Set)]
    ansi_colours: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Discover the targets of the portals and log in to them.
    Login(PortalsArgs),
    /// Discover the targets of the portals and log out from them.
    Logout(PortalsArgs),
    /// Keep the sessions alive until terminated.
    Watch,
}

#[derive(Debug, clap::Args)]
struct PortalsArgs {
    /// Comma-separated list of portals, eg: 10.0.0.1,10.0.0.2:3260,[fd00::1]:3260.
    #[clap(long)]
    portals: String,
}

impl CliArgs {
    /// Parse the arguments, exiting with 1 on usage errors.
    fn args() -> Self {
        match CliArgs::try_parse() {
            Ok(args) => args,
            Err(error) => {
                error.print().ok();
                std::process::exit(exit_code(&error));
            }
        }
    }
}

/// Exit code of a failed argument parsing: help and version requests are not errors.
fn exit_code(error: &clap::Error) -> i32 {
    if error.use_stderr() {
        1
    } else {
        0
    }
}

/// The initiator the sessions are driven with and its portal reachability check.
type Backend = (Arc<dyn Initiator>, Arc<dyn ConnectivityProbe>);

/// The host's open-iscsi initiator, with plain TCP reachability checks.
fn host_backend(config: &SessionConfig) -> anyhow::Result<Backend> {
    let initiator: Arc<dyn Initiator> = Arc::new(IscsiAdm::new(config.iscsiadm().cloned())?);
    let probe: Arc<dyn ConnectivityProbe> = Arc::new(TcpProbe::new(config.probe_timeout()));
    Ok((initiator, probe))
}

impl TryFrom<&CliArgs> for SessionConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        anyhow::ensure!(
            !args.op_timeout.is_zero(),
            "The operation timeout must not be zero"
        );
        anyhow::ensure!(
            !args.probe_timeout.is_zero(),
            "The probe timeout must not be zero"
        );
        anyhow::ensure!(
            !args.watch_period.is_zero(),
            "The watch period must not be zero"
        );
        anyhow::ensure!(
            *args.max_retry_backoff >= *args.retry_backoff,
            "The maximum retry backoff must not be lower than the retry backoff"
        );
        Ok(SessionConfig::default()
            .with_iscsiadm(args.iscsiadm.clone())
            .with_op_timeout(args.op_timeout.into())
            .with_probe_timeout(args.probe_timeout.into())
            .with_watch_period(args.watch_period.into())
            .with_max_login_attempts(args.max_login_attempts)
            .with_retry_backoff(args.retry_backoff.into(), args.max_retry_backoff.into())
            .with_max_concurrent_ops(args.max_concurrent_ops))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::args();
    utils::print_package_info!();

    TracingTelemetry::builder()
        .with_style(cli_args.fmt_style)
        .with_colours(cli_args.ansi_colours)
        .init("iscsi-session");

    execute(cli_args).await.map_err(|error| {
        tracing::error!(%error, "Terminated with error");
        error
    })
}

async fn execute(cli_args: CliArgs) -> anyhow::Result<()> {
    execute_with(cli_args, host_backend, ShutdownSignal::int_term()).await
}

/// Run the command against the backend built by `backend`.
/// Per portal and per target failures are logged and don't fail the command.
async fn execute_with(
    cli_args: CliArgs,
    backend: impl FnOnce(&SessionConfig) -> anyhow::Result<Backend>,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let config = SessionConfig::try_from(&cli_args)?;
    // the portals are validated before anything touches the network
    let portals = match &cli_args.command {
        Command::Login(args) | Command::Logout(args) => Some(PortalSet::parse(&args.portals)?),
        Command::Watch => None,
    };

    let (initiator, probe) = backend(&config)?;
    let manager = Arc::new(SessionManager::new(
        initiator,
        probe,
        Arc::new(SessionTable::new()),
        config,
    ));

    match (cli_args.command, portals) {
        (Command::Login(_), Some(portals)) => {
            tracing::info!(%portals, "Logging in");
            manager
                .discover_and_login(&portals, Some(&shutdown))
                .await
                .log();
        }
        (Command::Logout(_), Some(portals)) => {
            tracing::info!(%portals, "Logging out");
            manager
                .discover_and_logout(&portals, Some(&shutdown))
                .await
                .log();
        }
        (Command::Watch, _) => {
            SessionWatcher::new(manager).run(shutdown).await;
        }
        (command, None) => anyhow::bail!("No portals specified for {command:?}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iscsi_session::{
        initiator::LiveSession, portal::Portal, target::Target, Error, InitiatorError,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Exports a single target, which refuses every login.
    #[derive(Default)]
    struct RefusingInitiator {
        logins: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Initiator for RefusingInitiator {
        async fn discover(&self, _portal: &Portal) -> Result<Vec<String>, InitiatorError> {
            Ok(vec!["iqn.2024-01.io.example:a".to_string()])
        }
        async fn login(&self, _target: &Target) -> Result<(), InitiatorError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Err(InitiatorError::CommandFailed {
                binary: "iscsiadm".to_string(),
                operation: "login".to_string(),
                code: Some(24),
                stderr: "iscsiadm: initiator reported error (24 - iSCSI login failed due to authorization failure)".to_string(),
            })
        }
        async fn logout(&self, _target: &Target) -> Result<bool, InitiatorError> {
            Ok(false)
        }
        async fn sessions(&self) -> Result<Vec<LiveSession>, InitiatorError> {
            Ok(vec![])
        }
    }

    struct Reachable;

    #[async_trait::async_trait]
    impl ConnectivityProbe for Reachable {
        async fn probe(&self, candidates: &[String], _port: Option<u16>) -> Option<String> {
            candidates.first().cloned()
        }
    }

    fn args(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("iscsi-session").chain(args.iter().copied()))
    }

    #[test]
    fn usage_errors_exit_with_1() {
        let error = args(&["login"]).unwrap_err();
        assert_eq!(error.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert_eq!(exit_code(&error), 1);

        let error = args(&["logout", "--portals", "10.0.0.1", "--max-login-attempts", "0"])
            .unwrap_err();
        assert_eq!(exit_code(&error), 1);

        let error = args(&["--help"]).unwrap_err();
        assert_eq!(exit_code(&error), 0);
    }

    #[tokio::test]
    async fn invalid_portals_fail_before_the_backend_is_built() {
        for portals in ["", " , ", "10.0.0.1:0", "10.0.0.1,not a host"] {
            let built = AtomicBool::new(false);
            let (shutdown, _trigger) = ShutdownSignal::manual();
            let error = execute_with(
                args(&["login", "--portals", portals]).unwrap(),
                |_: &SessionConfig| -> anyhow::Result<Backend> {
                    built.store(true, Ordering::SeqCst);
                    anyhow::bail!("no backend")
                },
                shutdown,
            )
            .await
            .unwrap_err();

            assert!(
                matches!(error.downcast_ref::<Error>(), Some(Error::InvalidInput { .. })),
                "{portals:?}: {error}"
            );
            assert!(!built.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn target_failures_do_not_fail_the_command() {
        let initiator = Arc::new(RefusingInitiator::default());
        let backend = {
            let initiator: Arc<dyn Initiator> = initiator.clone();
            move |_: &SessionConfig| -> anyhow::Result<Backend> {
                let probe: Arc<dyn ConnectivityProbe> = Arc::new(Reachable);
                Ok((initiator, probe))
            }
        };
        let (shutdown, _trigger) = ShutdownSignal::manual();

        execute_with(
            args(&["login", "--portals", "10.0.0.1,10.0.0.2:3261"]).unwrap(),
            backend,
            shutdown,
        )
        .await
        .unwrap();
        assert_eq!(initiator.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backend_failures_fail_the_command() {
        let (shutdown, _trigger) = ShutdownSignal::manual();
        let result = execute_with(
            args(&["logout", "--portals", "10.0.0.1"]).unwrap(),
            |_: &SessionConfig| -> anyhow::Result<Backend> { anyhow::bail!("iscsiadm not found") },
            shutdown,
        )
        .await;
        assert!(result.is_err());
    }
}

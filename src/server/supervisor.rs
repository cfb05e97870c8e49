//! Runner executing the launch state machine's effects.

use std::time::Duration;

use color_eyre::eyre::eyre;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquire::AcquiredBinary;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::options::ServerOptions;

use super::bootstrap::{Remediation, run_bootstrap};
use super::output::render_server_output;
use super::process::{CommandSpec, Launcher, LogTail, ServerProcess};
use super::signature::detect_signature;
use super::state::{Effect, Event, Failure, LaunchMachine, State};
use super::workspace::InstanceWorkspace;

const LOG_TARGET: &str = "mysql_memory::server";

/// Interval between error log polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a server that reported a primary bind failure gets to exit by
/// itself before it is killed.
const CONFLICT_EXIT_GRACE: Duration = Duration::from_secs(5);

const MIN_PORT: u16 = 1025;

/// Ports a spawned server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ports {
    pub(crate) primary: u16,
    /// X protocol port, `None` when the plugin is disabled.
    pub(crate) aux: Option<u16>,
}

/// A server that reported readiness.
#[derive(Debug)]
pub(crate) struct Launched<P> {
    pub(crate) process: P,
    pub(crate) ports: Ports,
}

/// Everything the runner needs besides the launcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LaunchContext<'a> {
    pub(crate) binary: &'a AcquiredBinary,
    pub(crate) workspace: &'a InstanceWorkspace,
    pub(crate) options: &'a ServerOptions,
    pub(crate) remediation: &'a dyn Remediation,
    pub(crate) cancel: &'a CancellationToken,
}

/// Drives the state machine until the server is ready or the launch fails.
///
/// Any server still running when an error is returned is killed first.
pub(crate) async fn supervise<L: Launcher>(
    launcher: &L,
    ctx: LaunchContext<'_>,
) -> ServerResult<Launched<L::Process>> {
    let mut current: Option<Launched<L::Process>> = None;
    let result = drive(launcher, ctx, &mut current).await;
    match result {
        Ok(()) => current.ok_or_else(|| {
            ServerError::from(eyre!("launch resolved without a running server"))
        }),
        Err(err) => {
            if let Some(mut launched) = current.take() {
                kill_quietly(&mut launched.process).await;
            }
            Err(err)
        }
    }
}

async fn drive<L: Launcher>(
    launcher: &L,
    ctx: LaunchContext<'_>,
    current: &mut Option<Launched<L::Process>>,
) -> ServerResult<()> {
    let machine = LaunchMachine::new(ctx.options.port_retries, ctx.options.aux_protocol);
    let (mut state, mut effect) = machine.transition(State::Start, Event::Begin);
    loop {
        debug!(target: LOG_TARGET, ?state, ?effect, "launch step");
        let event = match effect {
            Effect::RunBootstrap => {
                cancellable(
                    ctx.cancel,
                    run_bootstrap(
                        launcher,
                        ctx.binary,
                        ctx.workspace,
                        ctx.options.bootstrap_timeout,
                        ctx.remediation,
                    ),
                )
                .await?;
                Event::BootstrapSucceeded
            }
            Effect::Spawn { aux_enabled } => {
                let ports = pick_ports(ctx.options, aux_enabled);
                ctx.workspace.reset_logs()?;
                let spec = server_spec(ctx.binary, ctx.workspace, ports);
                let process = launcher.spawn(&spec)?;
                info!(
                    target: LOG_TARGET,
                    port = ports.primary,
                    x_port = ?ports.aux,
                    "started mysqld; waiting for readiness"
                );
                let launched = current.insert(Launched { process, ports });
                let mut tail = launcher.tail(&ctx.workspace.error_log);
                watch(&mut launched.process, &mut tail, ctx).await?
            }
            Effect::ResetForRetry { kill } => {
                if let Some(mut launched) = current.take() {
                    warn!(
                        target: LOG_TARGET,
                        port = launched.ports.primary,
                        x_port = ?launched.ports.aux,
                        "port already in use; retrying on new ports"
                    );
                    stop_after_conflict(&mut launched.process, kill).await;
                }
                ctx.workspace.reset_data_dir()?;
                Event::WorkspaceReset
            }
            Effect::Resolve => return Ok(()),
            Effect::Fail(failure) => {
                if let Some(mut launched) = current.take() {
                    kill_quietly(&mut launched.process).await;
                }
                return Err(failure_error(failure, ctx));
            }
        };
        (state, effect) = machine.transition(state, event);
    }
}

/// Polls the error log until a signature appears, the process exits, or
/// the startup timeout expires.
async fn watch<P: ServerProcess, T: LogTail>(
    process: &mut P,
    tail: &mut T,
    ctx: LaunchContext<'_>,
) -> ServerResult<Event> {
    let deadline = Instant::now() + ctx.options.startup_timeout;
    loop {
        if let Some(signal) = detect_signature(&read_tail(tail)) {
            return Ok(Event::Detected(signal));
        }
        if let Some(exit) = process.try_exit().map_err(io_error)? {
            // The log may have been flushed just before the exit.
            if let Some(signal) = detect_signature(&read_tail(tail)) {
                return Ok(Event::Detected(signal));
            }
            debug!(target: LOG_TARGET, %exit, "server exited before reporting readiness");
            return Ok(Event::Exited);
        }
        if Instant::now() >= deadline {
            return Ok(Event::TimedOut);
        }
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(cancelled()),
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn read_tail<T: LogTail>(tail: &mut T) -> String {
    tail.read_new().unwrap_or_else(|err| {
        debug!(target: LOG_TARGET, error = %err, "failed to read server error log");
        String::new()
    })
}

async fn stop_after_conflict<P: ServerProcess>(process: &mut P, kill: bool) {
    if !kill {
        match tokio::time::timeout(CONFLICT_EXIT_GRACE, process.wait()).await {
            Ok(Ok(_)) => return,
            Ok(Err(err)) => debug!(target: LOG_TARGET, error = %err, "waiting for server failed"),
            Err(_) => debug!(target: LOG_TARGET, "server lingered after bind failure"),
        }
    }
    kill_quietly(process).await;
}

pub(super) async fn kill_quietly<P: ServerProcess>(process: &mut P) {
    if let Err(err) = process.kill().await {
        warn!(target: LOG_TARGET, error = %err, "failed to kill mysqld");
    }
}

async fn cancellable<F, T>(cancel: &CancellationToken, work: F) -> ServerResult<T>
where
    F: std::future::Future<Output = ServerResult<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(cancelled()),
        result = work => result,
    }
}

fn cancelled() -> ServerError {
    ServerError::new(ErrorKind::Cancelled, eyre!("server launch cancelled"))
}

fn io_error(err: std::io::Error) -> ServerError {
    ServerError::from(eyre!("failed to poll mysqld: {err}"))
}

/// Uses the caller's ports when given, otherwise draws distinct random ones.
///
/// A configured port of `0` counts as unset.
pub(crate) fn pick_ports(options: &ServerOptions, aux_enabled: bool) -> Ports {
    let mut rng = rand::thread_rng();
    let primary = options
        .port
        .filter(|port| *port != 0)
        .unwrap_or_else(|| rng.gen_range(MIN_PORT..=u16::MAX));
    let aux = aux_enabled.then(|| {
        options.x_port.filter(|port| *port != 0).unwrap_or_else(|| loop {
            let candidate = rng.gen_range(MIN_PORT..=u16::MAX);
            if candidate != primary {
                break candidate;
            }
        })
    });
    Ports { primary, aux }
}

/// Builds the long-running server invocation.
pub(crate) fn server_spec(
    binary: &AcquiredBinary,
    workspace: &InstanceWorkspace,
    ports: Ports,
) -> CommandSpec {
    let mut args = vec![
        "--no-defaults".to_owned(),
        format!("--basedir={}", binary.basedir),
        format!("--datadir={}", workspace.data_dir),
        format!("--port={}", ports.primary),
        format!("--socket={}", workspace.socket),
        format!("--log-error={}", workspace.error_log),
        format!("--init-file={}", workspace.init_file),
        "--bind-address=127.0.0.1".to_owned(),
        "--skip-log-bin".to_owned(),
    ];
    match ports.aux {
        Some(x_port) => {
            args.push(format!("--mysqlx-port={x_port}"));
            args.push(format!("--mysqlx-socket={}", workspace.x_socket));
            args.push("--mysqlx-bind-address=127.0.0.1".to_owned());
        }
        None => args.push("--mysqlx=OFF".to_owned()),
    }
    if super::running_as_root() {
        args.push("--user=root".to_owned());
    }
    CommandSpec {
        program: binary.executable.clone(),
        args,
        stdout: workspace.stdout_log.clone(),
        stderr: workspace.stderr_log.clone(),
    }
}

fn failure_error(failure: Failure, ctx: LaunchContext<'_>) -> ServerError {
    let output = || {
        render_server_output(
            &ctx.workspace.read_error_log(),
            &ctx.workspace.read_stderr(),
        )
    };
    match failure {
        Failure::PortConflictExhausted { attempts, aux } => ServerError::new(
            ErrorKind::PortConflictExhausted,
            eyre!(
                "every {} port tried was already in use ({attempts} attempts); raise the port \
                 retry budget{}",
                if aux { "X protocol" } else { "MySQL" },
                if aux {
                    " or disable the X protocol plugin"
                } else {
                    " or stop servers occupying the chosen ports"
                },
            ),
        ),
        Failure::EarlyExit => ServerError::new(
            ErrorKind::EarlyExit,
            eyre!(
                "mysqld {} exited before accepting connections\n{}",
                ctx.binary.version,
                output()
            ),
        ),
        Failure::StartupTimeout => ServerError::new(
            ErrorKind::StartupTimeout,
            eyre!(
                "mysqld {} did not report readiness within {}s and was killed\n{}",
                ctx.binary.version,
                ctx.options.startup_timeout.as_secs(),
                output()
            ),
        ),
        Failure::Unexpected { state, event } => ServerError::from(eyre!(
            "launch received {event:?} while in {state:?}"
        )),
    }
}

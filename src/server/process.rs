//! Process seams used by the launch runner.
//!
//! [`Launcher`] abstracts spawning and inspecting the server so the runner
//! can be driven by scripted fakes; [`TokioLauncher`] is the real
//! implementation.

use std::fs::File;
use std::future::Future;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::{ErrorKind, ServerError, ServerResult};

const LOG_TARGET: &str = "mysql_memory::server";

/// Program, arguments, and output destinations for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandSpec {
    pub(crate) program: Utf8PathBuf,
    pub(crate) args: Vec<String>,
    /// File receiving stdout.
    pub(crate) stdout: Utf8PathBuf,
    /// File receiving stderr.
    pub(crate) stderr: Utf8PathBuf,
}

/// Result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub(crate) success: bool,
    pub(crate) code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Exit {
    /// Exit code, `None` when terminated by a signal.
    pub(crate) code: Option<i32>,
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("a signal"),
        }
    }
}

/// Spawns and inspects server processes.
pub(crate) trait Launcher: Send + Sync {
    type Process: ServerProcess;
    type Tail: LogTail;

    /// Runs a command to completion, killing it after `timeout`.
    ///
    /// Output goes to the spec's files and is read back once the command
    /// ends, so a chatty command never stalls on a full pipe.
    fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> impl Future<Output = ServerResult<CommandOutput>> + Send;

    /// Starts a long-running process.
    fn spawn(&self, spec: &CommandSpec) -> ServerResult<Self::Process>;

    /// Follows a log file from its current end.
    fn tail(&self, path: &Utf8Path) -> Self::Tail;
}

/// A running server.
pub(crate) trait ServerProcess: Send + 'static {
    /// Returns how the process ended, or `None` while it runs.
    fn try_exit(&mut self) -> io::Result<Option<Exit>>;

    /// Waits for the process to exit.
    fn wait(&mut self) -> impl Future<Output = io::Result<Exit>> + Send;

    /// Forcibly terminates the process and its children.
    fn kill(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Incremental reader over a growing log file.
pub(crate) trait LogTail: Send {
    /// Returns complete lines appended since the previous call.
    fn read_new(&mut self) -> io::Result<String>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokioLauncher;

impl Launcher for TokioLauncher {
    type Process = TokioProcess;
    type Tail = FileTail;

    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> ServerResult<CommandOutput> {
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || run_blocking(&spec, timeout))
            .await
            .map_err(|err| ServerError::from(eyre!("command task failed: {err}")))?
    }

    fn spawn(&self, spec: &CommandSpec) -> ServerResult<TokioProcess> {
        let mut command = tokio::process::Command::new(spec.program.as_std_path());
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(redirect(&spec.stdout)?)
            .stderr(redirect(&spec.stderr)?)
            .kill_on_drop(true);
        let child = command
            .spawn()
            .with_context(|| format!("spawn {}", spec.program))?;
        debug!(target: LOG_TARGET, pid = ?child.id(), program = %spec.program, "spawned server");
        Ok(TokioProcess { child })
    }

    fn tail(&self, path: &Utf8Path) -> FileTail {
        FileTail::new(path)
    }
}

fn redirect(path: &Utf8Path) -> ServerResult<Stdio> {
    let file = File::create(path).with_context(|| format!("create {path}"))?;
    Ok(Stdio::from(file))
}

fn read_captured(path: &Utf8Path) -> ServerResult<String> {
    let bytes = std::fs::read(path).with_context(|| format!("read {path}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn run_blocking(spec: &CommandSpec, timeout: Duration) -> ServerResult<CommandOutput> {
    let mut command = Command::new(spec.program.as_std_path());
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(redirect(&spec.stdout)?)
        .stderr(redirect(&spec.stderr)?);
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {}", spec.program))?;

    let finished = child
        .wait_timeout(timeout)
        .with_context(|| format!("wait for {}", spec.program))?;
    if finished.is_none() {
        match child.kill() {
            Ok(()) => {}
            // `InvalidInput` indicates the child has already exited.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(eyre!("failed to terminate {} after timeout: {err}", spec.program).into());
            }
        }
    }
    let status = child
        .wait()
        .with_context(|| format!("reap {}", spec.program))?;
    if finished.is_none() {
        return Err(ServerError::new(
            ErrorKind::Bootstrap,
            eyre!(
                "{} timed out after {}s",
                spec.program,
                timeout.as_secs()
            ),
        ));
    }
    Ok(CommandOutput {
        success: status.success(),
        code: status.code(),
        stdout: read_captured(&spec.stdout)?,
        stderr: read_captured(&spec.stderr)?,
    })
}

/// A server spawned through Tokio.
#[derive(Debug)]
pub(crate) struct TokioProcess {
    child: tokio::process::Child,
}

impl ServerProcess for TokioProcess {
    fn try_exit(&mut self) -> io::Result<Option<Exit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| Exit { code: status.code() }))
    }

    async fn wait(&mut self) -> io::Result<Exit> {
        let status = self.child.wait().await?;
        Ok(Exit {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> io::Result<()> {
        #[cfg(windows)]
        if let Some(pid) = self.child.id() {
            // mysqld on Windows can leave helper processes; kill the tree.
            let status = tokio::process::Command::new("taskkill")
                .args(["/pid", &pid.to_string(), "/T", "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(err) = status {
                debug!(target: LOG_TARGET, pid, error = %err, "taskkill failed");
            }
        }
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Follows a file by byte offset, yielding only complete lines.
#[derive(Debug)]
pub(crate) struct FileTail {
    path: Utf8PathBuf,
    offset: u64,
    partial: String,
}

impl FileTail {
    pub(crate) fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            partial: String::new(),
        }
    }
}

impl LogTail for FileTail {
    fn read_new(&mut self) -> io::Result<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => return Err(err),
        };
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        let read = file.read_to_end(&mut bytes)?;
        self.offset = self.offset.saturating_add(read as u64);
        self.partial.push_str(&String::from_utf8_lossy(&bytes));

        let Some(end) = self.partial.rfind('\n') else {
            return Ok(String::new());
        };
        let rest = self.partial.split_off(end + 1);
        Ok(std::mem::replace(&mut self.partial, rest))
    }
}

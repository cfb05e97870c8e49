//! Data directory initialisation and missing-library remediation.

use std::borrow::Cow;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{Context, eyre};
use tracing::{info, warn};

use crate::acquire::AcquiredBinary;
use crate::cache::{DirLock, LockPolicy};
use crate::error::{ErrorKind, ServerError, ServerResult};

use super::output::truncate_output;
use super::process::{CommandOutput, CommandSpec, Launcher};
use super::workspace::InstanceWorkspace;

const LOG_TARGET: &str = "mysql_memory::server";

const LIBAIO: &str = "libaio.so.1";
/// Name Debian-family distributions gave libaio in the 64-bit `time_t` move.
const LIBAIO_T64: &str = "libaio.so.1t64";
const LOADER_MARKER: &str = "error while loading shared libraries: ";

/// Boxed future returned by [`Remediation::remediate`].
pub type RemediationFuture<'a> = Pin<Box<dyn Future<Output = ServerResult<()>> + Send + 'a>>;

/// Supplies a shared library the server binary failed to load.
pub trait Remediation: Debug + Send + Sync {
    /// File name of the library this strategy provides, as the dynamic
    /// loader reports it.
    fn library(&self) -> &str;

    /// Makes the library loadable by binaries under `basedir`.
    fn remediate<'a>(&'a self, basedir: &'a Utf8Path) -> RemediationFuture<'a>;
}

/// Copies the renamed `libaio.so.1t64` next to the server binaries as
/// `lib/private/libaio.so.1`, where the server's runpath looks first.
#[derive(Debug, Clone, Copy)]
pub struct LibaioRemediation {
    lock_policy: LockPolicy,
}

impl LibaioRemediation {
    /// Creates the strategy; the copy is serialised with `lock_policy`.
    #[must_use]
    pub const fn new(lock_policy: LockPolicy) -> Self {
        Self { lock_policy }
    }

    async fn install(&self, basedir: &Utf8Path) -> ServerResult<()> {
        let target = basedir.join("lib").join("private").join(LIBAIO);
        let lock = DirLock::acquire(&target, self.lock_policy).await?;
        if target.is_file() {
            lock.release()?;
            return Ok(());
        }
        let listing = ldconfig_listing().await?;
        let Some(source) = find_library(&listing, LIBAIO_T64) else {
            lock.release()?;
            return Err(missing_library_error(LIBAIO));
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
        }
        std::fs::copy(source, &target).with_context(|| format!("copy {source} to {target}"))?;
        info!(target: LOG_TARGET, source, target = %target, "installed libaio compatibility copy");
        lock.release()
    }
}

impl Remediation for LibaioRemediation {
    fn library(&self) -> &str {
        LIBAIO
    }

    fn remediate<'a>(&'a self, basedir: &'a Utf8Path) -> RemediationFuture<'a> {
        Box::pin(self.install(basedir))
    }
}

async fn ldconfig_listing() -> ServerResult<String> {
    let output = tokio::process::Command::new("ldconfig")
        .arg("-p")
        .output()
        .await
        .map_err(|err| {
            ServerError::new(
                ErrorKind::MissingSystemLibrary,
                eyre!("cannot search for {LIBAIO_T64}: running ldconfig failed: {err}"),
            )
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Finds the resolved path of `name` in `ldconfig -p` output.
pub(crate) fn find_library<'a>(listing: &'a str, name: &str) -> Option<&'a str> {
    listing.lines().find_map(|line| {
        let (entry, path) = line.split_once("=>")?;
        let soname = entry.split_whitespace().next()?;
        (soname == name).then(|| path.trim())
    })
}

/// Extracts the library named by a dynamic loader failure.
pub(crate) fn missing_library(stderr: &str) -> Option<&str> {
    let (_, rest) = stderr.split_once(LOADER_MARKER)?;
    rest.split(':').next().map(str::trim).filter(|lib| !lib.is_empty())
}

/// Builds the `--initialize-insecure` invocation.
pub(crate) fn bootstrap_spec(binary: &AcquiredBinary, workspace: &InstanceWorkspace) -> CommandSpec {
    let mut args = vec![
        "--no-defaults".to_owned(),
        "--initialize-insecure".to_owned(),
        format!("--basedir={}", binary.basedir),
        format!("--datadir={}", workspace.data_dir),
    ];
    if super::running_as_root() {
        args.push("--user=root".to_owned());
    }
    CommandSpec {
        program: binary.executable.clone(),
        args,
        stdout: workspace.bootstrap_stdout.clone(),
        stderr: workspace.bootstrap_stderr.clone(),
    }
}

/// Initialises the workspace's data directory, remediating a missing
/// library at most once.
pub(crate) async fn run_bootstrap<L: Launcher>(
    launcher: &L,
    binary: &AcquiredBinary,
    workspace: &InstanceWorkspace,
    timeout: Duration,
    remediation: &dyn Remediation,
) -> ServerResult<()> {
    let spec = bootstrap_spec(binary, workspace);
    let output = launcher.run(&spec, timeout).await?;
    if output.success {
        return Ok(());
    }
    let Some(library) = missing_library(&output.stderr) else {
        return Err(bootstrap_failed(&output));
    };
    if library != remediation.library() {
        return Err(missing_library_error(library));
    }

    warn!(
        target: LOG_TARGET,
        library,
        "mysqld cannot load a system library; attempting remediation"
    );
    remediation.remediate(&binary.basedir).await?;
    workspace.reset_data_dir()?;

    let retried = launcher.run(&spec, timeout).await?;
    if retried.success {
        return Ok(());
    }
    match missing_library(&retried.stderr) {
        Some(still_missing) => Err(missing_library_error(still_missing)),
        None => Err(bootstrap_failed(&retried)),
    }
}

fn bootstrap_failed(output: &CommandOutput) -> ServerError {
    let code = output
        .code
        .map_or_else(|| "a signal".to_owned(), |code| format!("exit code {code}"));
    ServerError::new(
        ErrorKind::Bootstrap,
        eyre!(
            "mysqld --initialize-insecure failed with {code}; the binary may not match this \
             platform or the data directory is not writable\nstdout: {}\nstderr: {}",
            truncate_output(Cow::Borrowed(output.stdout.trim_end())),
            truncate_output(Cow::Borrowed(output.stderr.trim_end())),
        ),
    )
}

fn missing_library_error(library: &str) -> ServerError {
    let hint = if library.starts_with("libaio") {
        "install libaio (Debian/Ubuntu: `apt install libaio1` or `libaio1t64`; \
         Fedora/RHEL: `dnf install libaio`)"
    } else {
        "install the system package that provides it"
    };
    ServerError::new(
        ErrorKind::MissingSystemLibrary,
        eyre!("mysqld cannot load the shared library {library}; {hint}"),
    )
}

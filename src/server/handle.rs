//! Caller-facing handle to a running server.

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup_helpers::try_remove_dir_all;
use crate::options::CleanupMode;

use super::process::ServerProcess;
use super::supervisor::{Launched, kill_quietly};
use super::teardown::{Leftovers, remove_leftovers};

const LOG_TARGET: &str = "mysql_memory::server";

/// Connection details and lifecycle control for one ephemeral server.
///
/// Call [`DatabaseHandle::stop`] when finished. Dropping the handle without
/// stopping it still kills the server, but removes files only once and
/// without retries.
#[derive(Debug)]
pub struct DatabaseHandle {
    port: u16,
    x_port: Option<u16>,
    socket: Utf8PathBuf,
    x_socket: Option<Utf8PathBuf>,
    db_name: String,
    username: String,
    version: Version,
    workspace_root: Utf8PathBuf,
    cleanup_mode: CleanupMode,
    isolated_root: Option<Utf8PathBuf>,
    server_token: CancellationToken,
    reaper: Option<JoinHandle<()>>,
}

/// Identity and files of a launched instance.
#[derive(Debug)]
pub(crate) struct HandleParts {
    pub(crate) socket: Utf8PathBuf,
    pub(crate) x_socket: Utf8PathBuf,
    pub(crate) db_name: String,
    pub(crate) username: String,
    pub(crate) version: Version,
    pub(crate) workspace_root: Utf8PathBuf,
    pub(crate) cleanup_mode: CleanupMode,
    pub(crate) isolated_root: Option<Utf8PathBuf>,
}

impl DatabaseHandle {
    /// Takes ownership of a ready server.
    ///
    /// A reaper task owns the process from here on: it kills the server when
    /// `server_token` (or its parent) is cancelled and logs an unexpected
    /// exit.
    pub(crate) fn adopt<P: ServerProcess>(
        launched: Launched<P>,
        parts: HandleParts,
        server_token: CancellationToken,
    ) -> Self {
        let Launched { mut process, ports } = launched;
        let token = server_token.clone();
        let reaper = tokio::spawn(async move {
            let exit = tokio::select! {
                biased;
                () = token.cancelled() => None,
                exit = process.wait() => Some(exit),
            };
            match exit {
                None => kill_quietly(&mut process).await,
                Some(Ok(exit)) => warn!(target: LOG_TARGET, %exit, "mysqld exited while in use"),
                Some(Err(err)) => warn!(target: LOG_TARGET, error = %err, "lost track of mysqld"),
            }
        });
        Self {
            port: ports.primary,
            x_port: ports.aux,
            socket: parts.socket,
            x_socket: ports.aux.map(|_| parts.x_socket),
            db_name: parts.db_name,
            username: parts.username,
            version: parts.version,
            workspace_root: parts.workspace_root,
            cleanup_mode: parts.cleanup_mode,
            isolated_root: parts.isolated_root,
            server_token,
            reaper: Some(reaper),
        }
    }

    /// Returns the TCP port the server listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the X protocol port, `None` when the plugin is disabled.
    #[must_use]
    pub const fn x_port(&self) -> Option<u16> {
        self.x_port
    }

    /// Returns the Unix socket path.
    #[must_use]
    pub fn socket(&self) -> &Utf8Path {
        &self.socket
    }

    /// Returns the X protocol socket path, `None` when the plugin is disabled.
    #[must_use]
    pub fn x_socket(&self) -> Option<&Utf8Path> {
        self.x_socket.as_deref()
    }

    /// Returns the database created at startup.
    #[must_use]
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Returns the account with access to every database.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the server version that was launched.
    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.version
    }

    /// Returns a `mysql://` URL for the database over TCP.
    ///
    /// The account has no password.
    #[must_use]
    pub fn connection_url(&self) -> String {
        format!(
            "mysql://{}@127.0.0.1:{}/{}",
            self.username, self.port, self.db_name
        )
    }

    /// Kills the server and removes its files.
    ///
    /// Always completes; cleanup problems are logged, not returned.
    pub async fn stop(mut self) {
        self.server_token.cancel();
        if let Some(reaper) = self.reaper.take() {
            if let Err(err) = reaper.await {
                warn!(target: LOG_TARGET, error = %err, "server reaper task failed");
            }
        }
        remove_leftovers(Leftovers {
            workspace_root: &self.workspace_root,
            cleanup_mode: self.cleanup_mode,
            isolated_root: self.isolated_root.as_deref(),
        })
        .await;
        info!(target: LOG_TARGET, port = self.port, "stopped mysqld");
    }
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        if self.reaper.is_none() {
            return;
        }
        warn!(
            target: LOG_TARGET,
            port = self.port,
            "DatabaseHandle dropped without stop(); killing mysqld"
        );
        self.server_token.cancel();
        if self.cleanup_mode.removes_data() {
            if let Err(err) = try_remove_dir_all(self.workspace_root.as_std_path()) {
                warn!(
                    target: LOG_TARGET,
                    path = %self.workspace_root,
                    error = %err,
                    "failed to remove instance workspace"
                );
            }
        }
        if let Some(root) = &self.isolated_root {
            if let Err(err) = try_remove_dir_all(root.as_std_path()) {
                warn!(
                    target: LOG_TARGET,
                    path = %root,
                    error = %err,
                    "failed to remove isolated binaries"
                );
            }
        }
    }
}

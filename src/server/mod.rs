//! Server provisioning: binary selection, launch supervision, and teardown.
//!
//! [`create_db`] is the async entry point; [`MysqlServer`] wraps it for
//! synchronous callers. Both return once the server has logged that it is
//! ready for connections.

mod bootstrap;
mod handle;
mod output;
mod process;
mod runtime;
mod signature;
mod state;
mod supervisor;
mod teardown;
mod workspace;


pub use bootstrap::{LibaioRemediation, Remediation, RemediationFuture};
pub use handle::DatabaseHandle;
pub use signature::{Signal, detect_signature};

use semver::Version;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::acquire::{AcquireOptions, AcquiredBinary, BinaryAcquirer};
use crate::cache::LockPolicy;
use crate::error::ServerResult;
use crate::installed::probe_installed;
use crate::options::ServerOptions;
use crate::version::{Constraints, Platform, VersionCatalog, resolve};

use handle::HandleParts;
use process::{Launcher, TokioLauncher};
use supervisor::{LaunchContext, supervise};
use teardown::{Leftovers, discard_isolated, remove_leftovers};
use workspace::InstanceWorkspace;

const LOG_TARGET: &str = "mysql_memory::server";

/// Starts a disposable server using the bundled version catalog.
///
/// Cancelling `cancel` aborts the launch, and later kills the server
/// behind the returned handle.
///
/// # Errors
///
/// Returns a [`ServerError`](crate::ServerError) whose
/// [`kind`](crate::ServerError::kind) identifies the failing stage.
///
/// # Examples
///
/// ```no_run
/// use mysql_memory_server::{ServerOptions, create_db};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> mysql_memory_server::ServerResult<()> {
/// let db = create_db(ServerOptions::default(), CancellationToken::new()).await?;
/// println!("{}", db.connection_url());
/// db.stop().await;
/// # Ok(())
/// # }
/// ```
pub async fn create_db(
    options: ServerOptions,
    cancel: CancellationToken,
) -> ServerResult<DatabaseHandle> {
    let catalog = VersionCatalog::bundled()?;
    create_db_from_catalog(&catalog, options, cancel).await
}

/// Starts a disposable server, resolving downloads against `catalog`.
///
/// # Errors
///
/// See [`create_db`].
pub async fn create_db_from_catalog(
    catalog: &VersionCatalog,
    options: ServerOptions,
    cancel: CancellationToken,
) -> ServerResult<DatabaseHandle> {
    let span = info_span!(
        target: crate::observability::LOG_TARGET,
        "create_db",
        db = %options.db_name
    );
    async {
        let binary = obtain_binary(catalog, &options, &cancel).await?;
        launch(binary, &options, &cancel).await
    }
    .instrument(span)
    .await
}

async fn obtain_binary(
    catalog: &VersionCatalog,
    options: &ServerOptions,
    cancel: &CancellationToken,
) -> ServerResult<AcquiredBinary> {
    if options.arch.is_none() {
        if let Some(installed) = probe_installed(options.version.as_ref()).await {
            return Ok(installed);
        }
    }
    let constraints = Constraints {
        version: options.version.clone(),
        platform: Platform::detect(options.arch.as_deref()),
        ignore_unsupported_system_version: options.ignore_unsupported_system_version,
    };
    let descriptors = resolve(catalog, &constraints)?;
    BinaryAcquirer::new(AcquireOptions::from(options))?
        .acquire(&descriptors, cancel)
        .await
}

/// Launches `binary` in a fresh workspace and waits for readiness.
///
/// # Errors
///
/// Fails with [`ErrorKind::Bootstrap`](crate::ErrorKind::Bootstrap),
/// [`ErrorKind::MissingSystemLibrary`](crate::ErrorKind::MissingSystemLibrary),
/// [`ErrorKind::PortConflictExhausted`](crate::ErrorKind::PortConflictExhausted),
/// [`ErrorKind::EarlyExit`](crate::ErrorKind::EarlyExit), or
/// [`ErrorKind::StartupTimeout`](crate::ErrorKind::StartupTimeout). The
/// workspace and isolated binaries are removed before returning an error.
pub async fn launch(
    binary: AcquiredBinary,
    options: &ServerOptions,
    cancel: &CancellationToken,
) -> ServerResult<DatabaseHandle> {
    let remediation = LibaioRemediation::new(LockPolicy {
        retries: options.lock_retries,
        retry_wait: options.lock_retry_wait,
    });
    launch_with(&TokioLauncher, binary, options, &remediation, cancel).await
}

pub(crate) async fn launch_with<L: Launcher>(
    launcher: &L,
    binary: AcquiredBinary,
    options: &ServerOptions,
    remediation: &dyn Remediation,
    cancel: &CancellationToken,
) -> ServerResult<DatabaseHandle> {
    let workspace = match InstanceWorkspace::create(&options.data_root) {
        Ok(workspace) => workspace,
        Err(err) => {
            if let Some(root) = binary.isolated_root.as_deref() {
                discard_isolated(root).await;
            }
            return Err(err);
        }
    };
    let server_token = cancel.child_token();
    let result = match workspace.write_init_script(options) {
        Ok(()) => {
            let ctx = LaunchContext {
                binary: &binary,
                workspace: &workspace,
                options,
                remediation,
                cancel: &server_token,
            };
            supervise(launcher, ctx).await
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(launched) => {
            info!(
                target: LOG_TARGET,
                version = %binary.version,
                port = launched.ports.primary,
                "mysqld ready for connections"
            );
            let parts = HandleParts {
                socket: workspace.socket.clone(),
                x_socket: workspace.x_socket.clone(),
                db_name: options.db_name.clone(),
                username: options.username.clone(),
                version: binary.version.clone(),
                workspace_root: workspace.root.clone(),
                cleanup_mode: options.cleanup_mode,
                isolated_root: binary.isolated_root.clone(),
            };
            Ok(DatabaseHandle::adopt(launched, parts, server_token))
        }
        Err(err) => {
            remove_leftovers(Leftovers {
                workspace_root: &workspace.root,
                cleanup_mode: options.cleanup_mode,
                isolated_root: binary.isolated_root.as_deref(),
            })
            .await;
            Err(err)
        }
    }
}

#[cfg(unix)]
pub(crate) fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub(crate) const fn running_as_root() -> bool {
    false
}

/// Blocking wrapper around [`create_db`] that owns its Tokio runtime.
///
/// Dropping the wrapper without calling [`MysqlServer::stop`] still kills
/// the server.
///
/// # Examples
///
/// ```no_run
/// use mysql_memory_server::{MysqlServer, ServerOptions};
///
/// let server = MysqlServer::start(ServerOptions::default())?;
/// println!("listening on {}", server.handle().port());
/// server.stop();
/// # Ok::<(), mysql_memory_server::ServerError>(())
/// ```
#[derive(Debug)]
pub struct MysqlServer {
    handle: DatabaseHandle,
    runtime: Runtime,
}

impl MysqlServer {
    /// Starts a server and blocks until it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error when the runtime cannot be created or the launch
    /// fails; see [`create_db`].
    pub fn start(options: ServerOptions) -> ServerResult<Self> {
        let runtime = runtime::build_runtime()?;
        let handle = runtime.block_on(create_db(options, CancellationToken::new()))?;
        Ok(Self { handle, runtime })
    }

    /// Returns the connection details.
    #[must_use]
    pub const fn handle(&self) -> &DatabaseHandle {
        &self.handle
    }

    /// Returns the server version that was launched.
    #[must_use]
    pub const fn version(&self) -> &Version {
        self.handle.version()
    }

    /// Kills the server and removes its files, blocking until done.
    pub fn stop(self) {
        let Self { handle, runtime } = self;
        runtime.block_on(handle.stop());
    }
}

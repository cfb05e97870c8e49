//! Provisions disposable MySQL servers for test suites.
//!
//! A server is resolved from a bundled catalog of upstream distributions
//! (or taken from an installed `mysqld` on `PATH`), downloaded once into a
//! shared, lock-protected cache, initialised into a private data directory,
//! and supervised until it reports readiness. Port collisions with other
//! processes are retried on fresh ports; everything the instance wrote is
//! removed when it stops.
//!
//! Use [`create_db`] from async code or [`MysqlServer`] from synchronous
//! tests.

mod acquire;
pub mod cache;
mod cleanup_helpers;
mod error;
mod fs;
mod installed;
mod observability;
mod options;
pub mod server;
#[doc(hidden)]
pub mod test_support;
pub mod version;

pub use acquire::{AcquireOptions, AcquiredBinary, BinaryAcquirer};
pub use error::{
    ConfigError, ConfigResult, ErrorKind, MysqlMemoryError, ResolutionAxis, Result, ServerError,
    ServerResult,
};
pub use installed::probe_installed;
pub use options::{AuxProtocol, CleanupMode, ServerOptions};
pub use server::{DatabaseHandle, MysqlServer, create_db, create_db_from_catalog, launch};

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::version::parse_version_req;

/// Captures server settings supplied via `MYSQL_*` environment variables.
///
/// Unset fields keep the [`ServerOptions`] defaults.
///
/// # Examples
/// ```
/// use mysql_memory_server::MysqlEnvCfg;
///
/// let cfg = MysqlEnvCfg::default();
/// assert!(cfg.port.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "MYSQL")]
pub struct MysqlEnvCfg {
    /// Version or range, e.g. `8.0.x` or `8.0.30 - 8.4.0`.
    ///
    /// Read from `MYSQL_VERSION`; the command-line flag is `--version-req`
    /// because `--version` belongs to clap.
    #[ortho_config(cli_long = "version-req")]
    pub version: Option<String>,
    /// Database created at startup.
    pub db_name: Option<String>,
    /// Account granted access to every database.
    pub username: Option<String>,
    /// Log verbosity of the command-line binary (`error` … `trace`).
    pub log_level: Option<String>,
    /// Fixed primary port; `0` picks one at random.
    pub port: Option<u16>,
    /// Fixed X protocol port; `0` picks one at random.
    pub x_port: Option<u16>,
    /// Fresh port pairs tried after a bind conflict.
    pub port_retries: Option<u32>,
    /// Polls made while another process holds the binary cache lock.
    pub lock_retries: Option<u32>,
    /// Milliseconds between cache lock polls.
    pub lock_retry_wait_ms: Option<u64>,
    /// Download retries per descriptor.
    pub download_retries: Option<u32>,
    /// Share downloaded binaries through the cache.
    pub download_binary_once: Option<bool>,
    /// Skip the kernel compatibility check.
    pub ignore_unsupported_system_version: Option<bool>,
    /// Architecture used for resolution instead of the host's.
    pub arch: Option<String>,
    /// X protocol mode: `OFF`, `ON`, or `FORCE`.
    pub x_protocol: Option<String>,
    /// SQL appended to the initialisation script.
    pub init_sql: Option<String>,
    /// Root of the shared binary cache.
    pub binary_cache_dir: Option<Utf8PathBuf>,
    /// Directory holding per-instance workspaces.
    pub data_root: Option<Utf8PathBuf>,
    /// Leave the instance workspace on disk after stopping.
    pub keep_data: Option<bool>,
    /// Seconds allowed for the server to report readiness.
    pub startup_timeout_secs: Option<u64>,
}

impl MysqlEnvCfg {
    /// Loads configuration from environment variables without parsing CLI
    /// arguments.
    ///
    /// # Errors
    /// Returns an error when a variable cannot be parsed into its field.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("mysql-memory-server")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Converts the configuration into validated [`ServerOptions`].
    ///
    /// # Errors
    /// Returns an error when the version range, log level, or X protocol
    /// mode is malformed.
    pub fn to_options(&self) -> ConfigResult<ServerOptions> {
        let mut options = ServerOptions::default();
        self.apply_version(&mut options)?;
        self.apply_identity(&mut options)?;
        self.apply_ports(&mut options)?;
        self.apply_budgets(&mut options);
        self.apply_paths(&mut options);
        Ok(options)
    }

    fn apply_version(&self, options: &mut ServerOptions) -> ConfigResult<()> {
        if let Some(raw) = &self.version {
            let req = parse_version_req(raw)
                .map_err(|err| ConfigError::from(eyre!("MYSQL_VERSION is invalid: {err}")))?;
            options.version = Some(req);
        }
        if let Some(arch) = &self.arch {
            options.arch = Some(arch.clone());
        }
        if let Some(ignore) = self.ignore_unsupported_system_version {
            options.ignore_unsupported_system_version = ignore;
        }
        Ok(())
    }

    fn apply_identity(&self, options: &mut ServerOptions) -> ConfigResult<()> {
        if let Some(db_name) = &self.db_name {
            options.db_name.clone_from(db_name);
        }
        if let Some(username) = &self.username {
            options.username.clone_from(username);
        }
        if let Some(sql) = &self.init_sql {
            options.init_sql.clone_from(sql);
        }
        if let Some(level) = &self.log_level {
            options.log_level = level.parse::<LevelFilter>().map_err(|err| {
                ConfigError::from(eyre!("MYSQL_LOG_LEVEL '{level}' is invalid: {err}"))
            })?;
        }
        Ok(())
    }

    fn apply_ports(&self, options: &mut ServerOptions) -> ConfigResult<()> {
        options.port = fixed_port(self.port).or(options.port);
        options.x_port = fixed_port(self.x_port).or(options.x_port);
        if let Some(mode) = &self.x_protocol {
            options.aux_protocol = mode.parse()?;
        }
        Ok(())
    }

    fn apply_budgets(&self, options: &mut ServerOptions) {
        if let Some(retries) = self.port_retries {
            options.port_retries = retries;
        }
        if let Some(retries) = self.lock_retries {
            options.lock_retries = retries;
        }
        if let Some(millis) = self.lock_retry_wait_ms {
            options.lock_retry_wait = Duration::from_millis(millis);
        }
        if let Some(retries) = self.download_retries {
            options.download_retries = retries;
        }
        if let Some(once) = self.download_binary_once {
            options.download_binary_once = once;
        }
        if let Some(secs) = self.startup_timeout_secs {
            options.startup_timeout = Duration::from_secs(secs);
        }
    }

    fn apply_paths(&self, options: &mut ServerOptions) {
        if let Some(dir) = &self.binary_cache_dir {
            options.binary_cache_dir.clone_from(dir);
        }
        if let Some(dir) = &self.data_root {
            options.data_root.clone_from(dir);
        }
        if self.keep_data == Some(true) {
            options.cleanup_mode = CleanupMode::None;
        }
    }
}

/// Maps the `0 = auto` convention onto `None`.
fn fixed_port(port: Option<u16>) -> Option<u16> {
    port.filter(|value| *value != 0)
}

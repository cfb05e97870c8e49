//! Validated settings consumed by resolution, acquisition, and supervision.

use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use semver::VersionReq;
use tracing::level_filters::LevelFilter;

use crate::cache::resolve_cache_dir;
use crate::error::ConfigError;
use crate::version::parse_version_req;

/// Default number of fresh port pairs tried after a bind conflict.
pub const DEFAULT_PORT_RETRIES: u32 = 10;
/// Default number of polls while a peer holds the binary cache lock.
pub const DEFAULT_LOCK_RETRIES: u32 = 1_000;
/// Default pause between cache lock polls.
pub const DEFAULT_LOCK_RETRY_WAIT: Duration = Duration::from_secs(1);
/// Default number of download retries per descriptor.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 10;
/// Default time allowed for the server to report readiness.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Default time allowed for `mysqld --initialize-insecure` to finish.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(180);

const DEFAULT_DB_NAME: &str = "dbdata";
const DEFAULT_USERNAME: &str = "root";
const DATA_ROOT_SUBDIR: &str = "mysqlmsn";

/// Controls the X protocol plugin, the server's auxiliary listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuxProtocol {
    /// Start the server with `--mysqlx=OFF`.
    Off,
    /// Enable the plugin, but fall back to launching without it when its
    /// port keeps colliding.
    On,
    /// Enable the plugin and fail when its port keeps colliding.
    #[default]
    Force,
}

impl FromStr for AuxProtocol {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "ON" => Ok(Self::On),
            "FORCE" => Ok(Self::Force),
            _ => Err(ConfigError::from(eyre!(
                "unknown X protocol mode '{}'; expected OFF, ON, or FORCE",
                raw.trim()
            ))),
        }
    }
}

/// Selects which instance files are removed when a server stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupMode {
    /// Remove the instance workspace (data directory, logs, sockets).
    #[default]
    DataOnly,
    /// Leave the workspace on disk for post-mortem inspection.
    None,
}

impl CleanupMode {
    pub(crate) const fn removes_data(self) -> bool {
        matches!(self, Self::DataOnly)
    }
}

/// Settings for one ephemeral server.
///
/// # Examples
/// ```
/// use mysql_memory_server::{AuxProtocol, ServerOptions};
///
/// let options = ServerOptions {
///     db_name: "orders".into(),
///     aux_protocol: AuxProtocol::Off,
///     ..ServerOptions::default()
/// };
/// assert_eq!(options.username, "root");
/// ```
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Version range the server must satisfy; `None` picks the newest.
    pub version: Option<VersionReq>,
    /// Database created before the handle is returned.
    pub db_name: String,
    /// Account granted access to every database.
    pub username: String,
    /// Verbosity used by the command-line binary's subscriber.
    pub log_level: LevelFilter,
    /// Fixed primary port; `None` draws a random port per attempt.
    pub port: Option<u16>,
    /// Fixed X protocol port; `None` draws a random port per attempt.
    pub x_port: Option<u16>,
    /// Fresh port pairs tried after a bind conflict.
    pub port_retries: u32,
    /// Polls made while a peer holds the binary cache lock.
    pub lock_retries: u32,
    /// Pause between cache lock polls.
    pub lock_retry_wait: Duration,
    /// Download retries per descriptor.
    pub download_retries: u32,
    /// Share downloaded binaries through the cache (`false` isolates them).
    pub download_binary_once: bool,
    /// Skip the kernel compatibility check instead of failing it.
    pub ignore_unsupported_system_version: bool,
    /// CPU architecture used for resolution instead of the host's.
    pub arch: Option<String>,
    /// X protocol plugin mode.
    pub aux_protocol: AuxProtocol,
    /// SQL appended to the generated initialisation script.
    pub init_sql: String,
    /// Root of the shared binary cache.
    pub binary_cache_dir: Utf8PathBuf,
    /// Directory holding per-instance workspaces.
    pub data_root: Utf8PathBuf,
    /// Files removed when the server stops.
    pub cleanup_mode: CleanupMode,
    /// Time allowed for the server to report readiness.
    pub startup_timeout: Duration,
    /// Time allowed for schema initialisation.
    pub bootstrap_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            version: None,
            db_name: DEFAULT_DB_NAME.to_owned(),
            username: DEFAULT_USERNAME.to_owned(),
            log_level: LevelFilter::ERROR,
            port: None,
            x_port: None,
            port_retries: DEFAULT_PORT_RETRIES,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_retry_wait: DEFAULT_LOCK_RETRY_WAIT,
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            download_binary_once: true,
            ignore_unsupported_system_version: false,
            arch: None,
            aux_protocol: AuxProtocol::default(),
            init_sql: String::new(),
            binary_cache_dir: resolve_cache_dir(),
            data_root: default_data_root(),
            cleanup_mode: CleanupMode::default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        }
    }
}

impl ServerOptions {
    /// Replaces the version range, accepting loose forms such as `8.0.x`.
    ///
    /// # Errors
    /// Returns an error when `raw` is not a valid version or range.
    pub fn with_version(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.version = Some(parse_version_req(raw)?);
        Ok(self)
    }
}

/// Kept short: Unix socket paths are limited to roughly 100 bytes.
fn default_data_root() -> Utf8PathBuf {
    let temp = std::env::temp_dir();
    Utf8PathBuf::from_path_buf(temp)
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join(DATA_ROOT_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("off", AuxProtocol::Off)]
    #[case("ON", AuxProtocol::On)]
    #[case(" Force ", AuxProtocol::Force)]
    fn aux_protocol_parses_case_insensitively(#[case] raw: &str, #[case] expected: AuxProtocol) {
        assert_eq!(raw.parse::<AuxProtocol>().expect("parse mode"), expected);
    }

    #[test]
    fn aux_protocol_rejects_unknown_modes() {
        let err = "sometimes"
            .parse::<AuxProtocol>()
            .expect_err("unknown mode must fail");
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let options = ServerOptions::default();
        assert_eq!(options.port_retries, 10);
        assert_eq!(options.lock_retries, 1_000);
        assert_eq!(options.download_retries, 10);
        assert!(options.download_binary_once);
        assert_eq!(options.aux_protocol, AuxProtocol::Force);
        assert!(options.data_root.ends_with(DATA_ROOT_SUBDIR));
    }

    #[test]
    fn with_version_accepts_wildcards() {
        let options = ServerOptions::default()
            .with_version("8.0.x")
            .expect("wildcard range");
        let req = options.version.expect("version set");
        assert!(req.matches(&semver::Version::new(8, 0, 34)));
        assert!(!req.matches(&semver::Version::new(8, 4, 0)));
    }
}

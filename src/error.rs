//! Domain error types for provisioning ephemeral MySQL servers.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return a [`MysqlMemoryError`].
pub type Result<T> = std::result::Result<T, MysqlMemoryError>;

/// Result alias for server lifecycle operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum MysqlMemoryError {
    /// Indicates resolving, acquiring, launching, or stopping a server failed.
    #[error("mysql server lifecycle failed")]
    Server(#[from] ServerError),
    /// Indicates configuration parsing failed.
    #[error("configuration parsing failed")]
    Config(#[from] ConfigError),
}

/// Compatibility axis that eliminated every catalog candidate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResolutionAxis {
    /// No distribution is published for the CPU architecture.
    Architecture,
    /// No distribution is published for the operating system.
    OperatingSystem,
    /// The host kernel falls outside every candidate's supported range.
    Kernel,
    /// No candidate version satisfies the requested version range.
    Version,
}

impl ResolutionAxis {
    /// Returns a short, human-readable label for log fields and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::OperatingSystem => "operating system",
            Self::Kernel => "kernel version",
            Self::Version => "version",
        }
    }
}

/// Categorises server failures so callers can branch on structured errors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ErrorKind {
    /// Represents errors without a more specific semantic meaning.
    #[default]
    Other,
    /// The version catalog holds no binary for the named axis.
    UnsupportedPlatform(ResolutionAxis),
    /// A peer held the cache lock for longer than the retry budget allows.
    LockTimeout,
    /// Downloading a binary archive failed after exhausting retries.
    Download,
    /// The remote store reported every candidate archive as missing.
    ArtifactMissing,
    /// The archive was corrupt, unsafe, or could not be written to disk.
    Extraction,
    /// The schema-initialisation invocation failed.
    Bootstrap,
    /// A shared system library required by the server binary is absent.
    MissingSystemLibrary,
    /// Every port pair tried within the retry budget was already in use.
    PortConflictExhausted,
    /// The server process exited before it reported readiness.
    EarlyExit,
    /// The server neither became ready nor exited within the startup timeout.
    StartupTimeout,
    /// Removing instance files failed where the failure cannot be ignored.
    Cleanup,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Captures server lifecycle failures.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct ServerError {
    kind: ErrorKind,
    #[source]
    report: Report,
}

impl ServerError {
    /// Constructs a new server error with the provided kind and diagnostic
    /// report.
    #[must_use]
    pub const fn new(kind: ErrorKind, report: Report) -> Self {
        Self { kind, report }
    }

    /// Returns the semantic category for this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<Report> for ServerError {
    fn from(report: Report) -> Self {
        Self::new(ErrorKind::Other, report)
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        let ConfigError(report) = err;
        Self::new(ErrorKind::Other, report)
    }
}

impl From<MysqlMemoryError> for ServerError {
    fn from(err: MysqlMemoryError) -> Self {
        match err {
            MysqlMemoryError::Server(inner) => inner,
            MysqlMemoryError::Config(inner) => inner.into(),
        }
    }
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn report_conversion_defaults_to_other_kind() {
        let err = ServerError::from(eyre!("boom"));
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn top_level_error_unwraps_to_server_error() {
        let inner = ServerError::new(ErrorKind::LockTimeout, eyre!("lock held"));
        let err = ServerError::from(MysqlMemoryError::from(inner));
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }
}

//! Detects a compatible `mysqld` already installed on the host.
//!
//! The probe is best effort: anything unexpected is logged at debug level
//! and treated as "not installed", so acquisition falls back to a download.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use semver::{Version, VersionReq};
use tracing::{debug, info};

use crate::acquire::AcquiredBinary;
use crate::version::coerce_version;

const LOG_TARGET: &str = "mysql_memory::resolve";

/// Oldest server the launcher's flags are compatible with.
const MINIMUM_VERSION: Version = Version::new(8, 0, 0);

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// What `mysqld --version` reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Banner {
    /// An Oracle MySQL server.
    Mysql(Version),
    /// A MariaDB build, whose bootstrap flags differ.
    MariaDb,
    /// Output that did not contain a version.
    Unrecognised,
}

/// Parses the first line printed by `mysqld --version`.
pub(crate) fn parse_banner(output: &str) -> Banner {
    if output.to_ascii_lowercase().contains("mariadb") {
        return Banner::MariaDb;
    }
    output
        .split_once(" Ver ")
        .and_then(|(_, rest)| coerce_version(rest))
        .map_or(Banner::Unrecognised, Banner::Mysql)
}

/// Looks for an installed server satisfying `requirement`.
///
/// Returns `None` when no candidate exists, when it is MariaDB, older than
/// 8.0.0, or outside the requested range.
pub async fn probe_installed(requirement: Option<&VersionReq>) -> Option<AcquiredBinary> {
    let executable = locate(std::env::var_os("PATH").as_deref())?;
    let banner = read_banner(&executable).await?;
    accept(executable, &banner, requirement)
}

fn accept(
    executable: Utf8PathBuf,
    banner: &Banner,
    requirement: Option<&VersionReq>,
) -> Option<AcquiredBinary> {
    let version = match banner {
        Banner::Mysql(version) => version.clone(),
        Banner::MariaDb => {
            debug!(target: LOG_TARGET, path = %executable, "ignoring installed MariaDB server");
            return None;
        }
        Banner::Unrecognised => {
            debug!(target: LOG_TARGET, path = %executable, "unrecognised mysqld version banner");
            return None;
        }
    };
    if version < MINIMUM_VERSION {
        debug!(target: LOG_TARGET, version = %version, "installed server is too old");
        return None;
    }
    if requirement.is_some_and(|req| !req.matches(&version)) {
        debug!(
            target: LOG_TARGET,
            version = %version,
            "installed server does not satisfy the requested version"
        );
        return None;
    }
    let basedir = executable.parent()?.parent()?.to_path_buf();
    info!(target: LOG_TARGET, version = %version, path = %executable, "using installed MySQL server");
    Some(AcquiredBinary {
        version,
        executable,
        basedir,
        isolated_root: None,
    })
}

/// Finds `mysqld` on `path_var`, then in the standard Windows install root.
fn locate(path_var: Option<&OsStr>) -> Option<Utf8PathBuf> {
    let name = format!("mysqld{}", std::env::consts::EXE_SUFFIX);
    path_var
        .into_iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
        .or_else(windows_install)
        .and_then(|found| Utf8PathBuf::from_path_buf(found).ok())
}

#[cfg(windows)]
fn windows_install() -> Option<PathBuf> {
    let root = std::path::Path::new(r"C:\Program Files\MySQL");
    std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let version = coerce_version(name.strip_prefix("MySQL Server ")?)?;
            let exe = entry.path().join("bin").join("mysqld.exe");
            exe.is_file().then_some((version, exe))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, exe)| exe)
}

#[cfg(not(windows))]
const fn windows_install() -> Option<PathBuf> {
    None
}

async fn read_banner(executable: &Utf8Path) -> Option<Banner> {
    let output = tokio::time::timeout(
        VERSION_TIMEOUT,
        tokio::process::Command::new(executable)
            .arg("--version")
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match output {
        Ok(Ok(out)) if out.status.success() => {
            Some(parse_banner(&String::from_utf8_lossy(&out.stdout)))
        }
        Ok(Ok(out)) => {
            debug!(target: LOG_TARGET, status = %out.status, "mysqld --version failed");
            None
        }
        Ok(Err(err)) => {
            debug!(target: LOG_TARGET, error = %err, "could not run mysqld --version");
            None
        }
        Err(_) => {
            debug!(target: LOG_TARGET, "mysqld --version timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        "/usr/sbin/mysqld  Ver 8.0.34 for Linux on x86_64 (MySQL Community Server - GPL)",
        Banner::Mysql(Version::new(8, 0, 34))
    )]
    #[case(
        "mysqld  Ver 8.4.2 for macos14 on arm64 (MySQL Community Server - GPL)",
        Banner::Mysql(Version::new(8, 4, 2))
    )]
    #[case(
        "/usr/sbin/mysqld  Ver 10.6.12-MariaDB-0ubuntu0.22.04.1 for debian-linux-gnu on x86_64",
        Banner::MariaDb
    )]
    #[case("garbage", Banner::Unrecognised)]
    fn banners(#[case] output: &str, #[case] expected: Banner) {
        assert_eq!(parse_banner(output), expected);
    }

    #[rstest]
    #[case(Banner::Mysql(Version::new(8, 0, 34)), None, true)]
    #[case(Banner::Mysql(Version::new(8, 0, 34)), Some("8.0.x"), true)]
    #[case(Banner::Mysql(Version::new(8, 0, 34)), Some("^8.4"), false)]
    #[case(Banner::Mysql(Version::new(5, 7, 44)), None, false)]
    #[case(Banner::MariaDb, None, false)]
    fn acceptance(#[case] banner: Banner, #[case] req: Option<&str>, #[case] accepted: bool) {
        let req = req.map(|raw| crate::version::parse_version_req(raw).expect("req"));
        let result = accept(Utf8PathBuf::from("/usr/sbin/mysqld"), &banner, req.as_ref());
        assert_eq!(result.is_some(), accepted);
    }

    #[test]
    fn accepted_binary_uses_install_prefix_as_basedir() {
        let binary = accept(
            Utf8PathBuf::from("/opt/mysql/bin/mysqld"),
            &Banner::Mysql(Version::new(8, 0, 34)),
            None,
        )
        .expect("accepted");
        assert_eq!(binary.basedir, "/opt/mysql");
        assert!(binary.isolated_root.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn locates_and_reads_fake_server_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let bin = temp.path().join("bin");
        std::fs::create_dir(&bin).expect("bin dir");
        let exe = bin.join("mysqld");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho '/usr/sbin/mysqld  Ver 8.0.36 for Linux on x86_64'\n",
        )
        .expect("script");
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let found = locate(Some(bin.as_os_str())).expect("found on PATH");
        let banner = read_banner(&found).await.expect("banner");

        assert_eq!(banner, Banner::Mysql(Version::new(8, 0, 36)));
    }

    #[test]
    fn empty_path_finds_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        if cfg!(not(windows)) {
            assert!(locate(Some(temp.path().as_os_str())).is_none());
        }
    }
}

//! Cache hit/miss detection for extracted server binaries.

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use tracing::debug;

/// Observability target for cache operations.
const LOG_TARGET: &str = "mysql_memory::cache";

/// Directory every archive is normalised to inside an extraction root.
pub const SERVER_DIR: &str = "mysql";

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookupResult {
    /// The extraction root holds a server executable.
    Hit {
        /// Extraction root for the version.
        root: Utf8PathBuf,
        /// Path to `mysqld` inside the root.
        executable: Utf8PathBuf,
    },
    /// Nothing usable has been extracted for the version.
    Miss,
}

/// Returns the server executable inside an extraction root.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use mysql_memory_server::cache::executable_path;
///
/// let exe = executable_path(Utf8Path::new("/cache/8.0.34"));
/// assert!(exe.as_str().starts_with("/cache/8.0.34/mysql/bin/mysqld"));
/// ```
#[must_use]
pub fn executable_path(root: &Utf8Path) -> Utf8PathBuf {
    root.join(SERVER_DIR)
        .join("bin")
        .join(format!("mysqld{}", std::env::consts::EXE_SUFFIX))
}

/// Returns the shared extraction root for `version`.
#[must_use]
pub fn version_root(cache_dir: &Utf8Path, version: &Version) -> Utf8PathBuf {
    cache_dir.join(version.to_string())
}

/// Checks whether the cache holds a usable extraction of `version`.
///
/// An entry counts only when its executable exists; interrupted extractions
/// never reach the final path, so a bare directory is a miss.
#[must_use]
pub fn check_cache(cache_dir: &Utf8Path, version: &Version) -> CacheLookupResult {
    let root = version_root(cache_dir, version);
    let executable = executable_path(&root);
    if executable.is_file() {
        debug!(target: LOG_TARGET, version = %version, path = %root, "cache hit");
        CacheLookupResult::Hit { root, executable }
    } else {
        debug!(
            target: LOG_TARGET,
            version = %version,
            root_exists = root.is_dir(),
            "cache miss"
        );
        CacheLookupResult::Miss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache_root(temp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path")
    }

    #[test]
    fn missing_version_is_a_miss() {
        let temp = tempdir().expect("tempdir");
        let result = check_cache(&cache_root(&temp), &Version::new(8, 0, 34));
        assert_eq!(result, CacheLookupResult::Miss);
    }

    #[test]
    fn directory_without_executable_is_a_miss() {
        let temp = tempdir().expect("tempdir");
        let cache = cache_root(&temp);
        std::fs::create_dir_all(cache.join("8.0.34/mysql/bin")).expect("partial tree");

        let result = check_cache(&cache, &Version::new(8, 0, 34));

        assert_eq!(result, CacheLookupResult::Miss);
    }

    #[test]
    fn extracted_executable_is_a_hit() {
        let temp = tempdir().expect("tempdir");
        let cache = cache_root(&temp);
        let version = Version::new(8, 0, 34);
        let exe = executable_path(&version_root(&cache, &version));
        std::fs::create_dir_all(exe.parent().expect("bin dir")).expect("bin dir");
        std::fs::write(&exe, b"#!/bin/sh\n").expect("write exe");

        let result = check_cache(&cache, &version);

        assert_eq!(
            result,
            CacheLookupResult::Hit {
                root: cache.join("8.0.34"),
                executable: exe,
            }
        );
    }
}

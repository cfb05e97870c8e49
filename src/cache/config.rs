//! Resolves the binary cache directory from the environment with
//! XDG-compliant fallbacks.

use camino::Utf8PathBuf;
use std::path::PathBuf;

/// Environment variable that overrides the cache location.
pub const CACHE_DIR_ENV: &str = "MYSQL_BINARY_CACHE_DIR";

/// Subdirectory path within the XDG cache home.
const CACHE_SUBDIR: &str = "mysql-memory-server/binaries";

/// Resolves the binary cache directory.
///
/// The resolution order is:
///
/// 1. `MYSQL_BINARY_CACHE_DIR` if set, non-blank, and valid UTF-8
/// 2. `$XDG_CACHE_HOME/mysql-memory-server/binaries`
/// 3. `~/.cache/mysql-memory-server/binaries`
/// 4. `<temp dir>/mysql-memory-server/binaries`
///
/// # Examples
///
/// ```
/// use mysql_memory_server::cache::resolve_cache_dir;
///
/// let cache_dir = resolve_cache_dir();
/// assert!(cache_dir.as_str().contains("mysql"));
/// ```
#[must_use]
pub fn resolve_cache_dir() -> Utf8PathBuf {
    resolve_from_env()
        .or_else(resolve_from_xdg_cache)
        .or_else(resolve_from_home)
        .unwrap_or_else(resolve_from_temp)
}

fn resolve_from_env() -> Option<Utf8PathBuf> {
    non_blank_env(CACHE_DIR_ENV)
}

fn resolve_from_xdg_cache() -> Option<Utf8PathBuf> {
    non_blank_env("XDG_CACHE_HOME").map(|path| path.join(CACHE_SUBDIR))
}

fn resolve_from_home() -> Option<Utf8PathBuf> {
    let home = dirs::home_dir()?;
    let path = Utf8PathBuf::from_path_buf(home).ok()?;
    Some(path.join(".cache").join(CACHE_SUBDIR))
}

fn resolve_from_temp() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join(CACHE_SUBDIR)
}

fn non_blank_env(key: &str) -> Option<Utf8PathBuf> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Utf8PathBuf::from_path_buf(PathBuf::from(trimmed)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_env::with_vars;

    #[test]
    fn explicit_env_var_wins() {
        let expected = "/custom/cache/path";
        let result = with_vars(
            [
                (CACHE_DIR_ENV, Some(expected)),
                ("XDG_CACHE_HOME", Some("/ignored")),
            ],
            resolve_cache_dir,
        );
        assert_eq!(result.as_str(), expected);
    }

    #[test]
    fn xdg_cache_home_is_used_when_override_unset() {
        let result = with_vars(
            [
                (CACHE_DIR_ENV, None::<&str>),
                ("XDG_CACHE_HOME", Some("/home/tester/.cache")),
            ],
            resolve_cache_dir,
        );
        assert_eq!(
            result.as_str(),
            format!("/home/tester/.cache/{CACHE_SUBDIR}").as_str()
        );
    }

    #[test]
    fn blank_override_is_ignored() {
        let result = with_vars(
            [
                (CACHE_DIR_ENV, Some("   ")),
                ("XDG_CACHE_HOME", Some("/home/tester/.cache")),
            ],
            resolve_cache_dir,
        );
        assert!(result.as_str().ends_with(CACHE_SUBDIR));
        assert!(result.as_str().starts_with("/home/tester/.cache"));
    }
}

//! Guarded directory removal, including a retrying variant for trees whose
//! file handles the OS has not yet released after a forced kill.

use std::io::ErrorKind;
use std::path::{Component, Path};
use std::time::Duration;

use tracing::debug;

const LOG_TARGET: &str = "mysql_memory::cleanup";

/// Attempts made by [`remove_dir_with_retry`] before giving up.
pub(crate) const REMOVAL_ATTEMPTS: u32 = 20;

/// Pause between attempts made by [`remove_dir_with_retry`].
pub(crate) const REMOVAL_BACKOFF: Duration = Duration::from_millis(500);

/// Records the outcome of a guarded directory removal attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RemovalOutcome {
    Removed,
    Missing,
}

/// Returns `true` when `path` contains a parent-directory (`..`) component.
pub(crate) fn has_parent_dir(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Removes a directory tree, rejecting unsafe paths before deletion.
pub(crate) fn try_remove_dir_all(path: &Path) -> Result<RemovalOutcome, std::io::Error> {
    guard_removal_path(path)?;
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(RemovalOutcome::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RemovalOutcome::Missing),
        Err(err) => Err(err),
    }
}

/// Removes a directory tree, retrying busy or locked files with a fixed
/// backoff.
///
/// Unsafe paths fail immediately; every other error is retried up to
/// `attempts` times and the last one is returned.
pub(crate) async fn remove_dir_with_retry(
    path: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<RemovalOutcome, std::io::Error> {
    let mut attempt = 1;
    loop {
        match try_remove_dir_all(path) {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.kind() == ErrorKind::InvalidInput => return Err(err),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "directory removal failed; retrying"
                );
            }
        }
        attempt += 1;
        tokio::time::sleep(backoff).await;
    }
}

fn guard_removal_path(path: &Path) -> Result<(), std::io::Error> {
    if is_empty_or_root(path) || has_parent_dir(path) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("refuse to remove unsafe path {}", path.display()),
        ));
    }
    Ok(())
}

fn is_empty_or_root(path: &Path) -> bool {
    let mut components = path.components();
    match components.next() {
        None => true,
        Some(Component::CurDir | Component::RootDir) => components.next().is_none(),
        Some(Component::Prefix(_)) => match components.next() {
            None => true,
            Some(Component::RootDir) => components.next().is_none(),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case::root("/")]
    #[case::empty("")]
    #[case::current(".")]
    #[case::parent("/tmp/../etc")]
    fn unsafe_paths_are_rejected(#[case] raw: &str) {
        let err = try_remove_dir_all(Path::new(raw)).expect_err("unsafe path must be rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_directory_reports_missing() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("absent");
        let outcome = try_remove_dir_all(&target).expect("missing is not an error");
        assert_eq!(outcome, RemovalOutcome::Missing);
    }

    #[tokio::test]
    async fn retrying_removal_deletes_tree() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("instance/data");
        std::fs::create_dir_all(&target).expect("create tree");
        std::fs::write(target.join("ibdata1"), b"pages").expect("write file");

        let outcome = remove_dir_with_retry(
            &temp.path().join("instance"),
            3,
            Duration::from_millis(1),
        )
        .await
        .expect("remove tree");

        assert_eq!(outcome, RemovalOutcome::Removed);
        assert!(!temp.path().join("instance").exists());
    }

    #[tokio::test]
    async fn retrying_removal_gives_up_on_unsafe_path_immediately() {
        let err = remove_dir_with_retry(Path::new("/"), 5, Duration::from_secs(60))
            .await
            .expect_err("root must be rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}

//! Best-effort removal of instance and isolated binary directories.

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::cleanup_helpers::{
    REMOVAL_ATTEMPTS, REMOVAL_BACKOFF, RemovalOutcome, remove_dir_with_retry,
};
use crate::options::CleanupMode;

const LOG_TARGET: &str = "mysql_memory::server";

/// Files a stopped (or failed) server leaves for teardown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leftovers<'a> {
    pub(crate) workspace_root: &'a Utf8Path,
    pub(crate) cleanup_mode: CleanupMode,
    pub(crate) isolated_root: Option<&'a Utf8Path>,
}

/// Removes the workspace (per `cleanup_mode`) and any isolated binaries.
///
/// Never fails: freshly killed servers can hold files briefly, so each
/// removal is retried, and what still fails is logged.
pub(crate) async fn remove_leftovers(leftovers: Leftovers<'_>) {
    if leftovers.cleanup_mode.removes_data() {
        remove_logged(leftovers.workspace_root, "instance workspace").await;
    } else {
        debug!(
            target: LOG_TARGET,
            path = %leftovers.workspace_root,
            "keeping instance workspace"
        );
    }
    if let Some(root) = leftovers.isolated_root {
        discard_isolated(root).await;
    }
}

/// Removes binaries installed for a single instance.
pub(crate) async fn discard_isolated(root: &Utf8Path) {
    remove_logged(root, "isolated server binaries").await;
}

async fn remove_logged(path: &Utf8Path, what: &str) {
    match remove_dir_with_retry(path.as_std_path(), REMOVAL_ATTEMPTS, REMOVAL_BACKOFF).await {
        Ok(RemovalOutcome::Removed) => debug!(target: LOG_TARGET, path = %path, "removed {what}"),
        Ok(RemovalOutcome::Missing) => debug!(target: LOG_TARGET, path = %path, "{what} already gone"),
        Err(err) => warn!(
            target: LOG_TARGET,
            path = %path,
            error = %err,
            "failed to remove {what}; delete it manually"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case(CleanupMode::DataOnly, false)]
    #[case(CleanupMode::None, true)]
    #[tokio::test]
    async fn honours_cleanup_mode(#[case] mode: CleanupMode, #[case] kept: bool) {
        let temp = tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().join("abc123")).expect("utf8");
        let isolated = Utf8PathBuf::from_path_buf(temp.path().join("isolated")).expect("utf8");
        std::fs::create_dir_all(root.join("data")).expect("workspace");
        std::fs::create_dir_all(isolated.join("mysql/bin")).expect("isolated");

        remove_leftovers(Leftovers {
            workspace_root: &root,
            cleanup_mode: mode,
            isolated_root: Some(&isolated),
        })
        .await;

        assert_eq!(root.exists(), kept);
        assert!(!isolated.exists());
    }
}

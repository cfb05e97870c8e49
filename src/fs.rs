//! Capability-scoped directory helpers for instance workspaces.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs::Dir};
use color_eyre::eyre::{Context, Result};
use std::io::ErrorKind;

/// Mode applied to instance workspaces so other local users cannot read the
/// data directory or connect through the sockets.
#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Splits `path` into an ambient directory handle and the path relative to it.
///
/// Absolute paths are opened relative to the ambient root; relative paths reuse
/// the current working directory.
pub(crate) fn ambient_dir_and_path(path: &Utf8Path) -> Result<(Dir, Utf8PathBuf)> {
    if let Ok(stripped) = path.strip_prefix("/") {
        let dir = Dir::open_ambient_dir("/", ambient_authority())
            .context("open ambient root directory")?;
        return Ok((dir, stripped.to_path_buf()));
    }
    let dir = Dir::open_ambient_dir(".", ambient_authority())
        .context("open ambient working directory")?;
    Ok((dir, path.to_path_buf()))
}

/// Ensures `path` exists, creating intermediate directories when required.
pub(crate) fn ensure_dir_exists(path: &Utf8Path) -> Result<()> {
    #[cfg(windows)]
    {
        // cap-std cannot open a drive root ambiently; std is sufficient here.
        return std::fs::create_dir_all(path).with_context(|| format!("create {path}"));
    }

    #[cfg(not(windows))]
    {
        let (dir, relative) = ambient_dir_and_path(path)?;
        if relative.as_str().is_empty() {
            return Ok(());
        }
        dir.create_dir_all(relative.as_std_path())
            .or_else(|err| match err.kind() {
                ErrorKind::AlreadyExists => Ok(()),
                _ => Err(err),
            })
            .with_context(|| format!("create {path}"))
    }
}

/// Creates `path` (and its parents) and restricts it to the current user.
pub(crate) fn create_private_dir(path: &Utf8Path) -> Result<()> {
    ensure_dir_exists(path)?;

    #[cfg(unix)]
    {
        use cap_std::fs::{Permissions, PermissionsExt};

        let (dir, relative) = ambient_dir_and_path(path)?;
        if !relative.as_str().is_empty() {
            dir.set_permissions(
                relative.as_std_path(),
                Permissions::from_mode(PRIVATE_DIR_MODE),
            )
            .with_context(|| format!("chmod {path}"))?;
        }
    }

    Ok(())
}

//! Format-aware archive extraction with layout normalisation.
//!
//! Archives unpack into a staging directory beside the destination. The
//! staged tree is reshaped so the server lives under `mysql/`, checked for
//! an executable, and only then renamed onto the destination.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use camino::Utf8Path;
use color_eyre::eyre::{Context, Report, eyre};
use tracing::debug;

use crate::cache::{SERVER_DIR, executable_path};

const LOG_TARGET: &str = "mysql_memory::acquire";

/// Archive encodings the acquirer understands, detected from the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveFormat {
    TarGz,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    /// Detects the format from an archive file name.
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Why an extraction failed.
#[derive(Debug)]
pub(crate) enum ExtractError {
    /// An entry tried to escape the extraction root; retrying cannot help.
    Unsafe(Report),
    /// The archive was unreadable or incomplete, possibly a bad download.
    Corrupt(Report),
}

/// Unpacks `archive` and installs it at `destination`.
///
/// Blocking; callers run it on the blocking pool. Any previous content of
/// `destination` is replaced.
pub(crate) fn install_archive(
    archive: &Path,
    format: ArchiveFormat,
    destination: &Utf8Path,
) -> Result<(), ExtractError> {
    let parent = destination
        .parent()
        .ok_or_else(|| ExtractError::Corrupt(eyre!("{destination} has no parent directory")))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)
        .with_context(|| format!("create staging directory in {parent}"))
        .map_err(ExtractError::Corrupt)?;
    let unpacked = staging.path().join("unpacked");
    fs::create_dir(&unpacked)
        .context("create unpack directory")
        .map_err(ExtractError::Corrupt)?;

    match format {
        ArchiveFormat::TarGz => {
            unpack_tar(flate2::read::GzDecoder::new(open(archive)?), &unpacked)?;
        }
        ArchiveFormat::TarXz => {
            unpack_tar(xz2::read::XzDecoder::new(open(archive)?), &unpacked)?;
        }
        ArchiveFormat::Zip => unpack_zip(open(archive)?, &unpacked)?,
    }

    let root = staging.path().join("root");
    normalise_layout(&unpacked, &root).map_err(ExtractError::Corrupt)?;

    let staged_root = Utf8Path::from_path(&root)
        .ok_or_else(|| ExtractError::Corrupt(eyre!("staging path is not UTF-8")))?;
    let executable = executable_path(staged_root);
    if !executable.is_file() {
        return Err(ExtractError::Corrupt(eyre!(
            "archive does not contain {SERVER_DIR}/bin/{}",
            executable.file_name().unwrap_or("mysqld")
        )));
    }

    replace_destination(&root, destination).map_err(ExtractError::Corrupt)?;
    debug!(target: LOG_TARGET, path = %destination, "installed server binaries");
    Ok(())
}

fn open(archive: &Path) -> Result<fs::File, ExtractError> {
    fs::File::open(archive)
        .with_context(|| format!("open archive {}", archive.display()))
        .map_err(ExtractError::Corrupt)
}

fn unpack_tar<R: io::Read>(reader: R, dest: &Path) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .context("read tar entries")
        .map_err(ExtractError::Corrupt)?;
    for entry in entries {
        let mut entry = entry
            .context("read tar entry")
            .map_err(ExtractError::Corrupt)?;
        let path = entry
            .path()
            .context("decode tar entry path")
            .map_err(ExtractError::Corrupt)?
            .into_owned();
        if escapes_root(&path) {
            return Err(unsafe_entry(&path));
        }
        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {}", path.display()))
            .map_err(ExtractError::Corrupt)?;
        if !unpacked {
            return Err(unsafe_entry(&path));
        }
    }
    Ok(())
}

fn unpack_zip(file: fs::File, dest: &Path) -> Result<(), ExtractError> {
    let mut archive = zip::ZipArchive::new(file)
        .context("read zip directory")
        .map_err(ExtractError::Corrupt)?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .context("read zip entry")
            .map_err(ExtractError::Corrupt)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(unsafe_entry(Path::new(entry.name())));
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)
                .with_context(|| format!("create {}", out.display()))
                .map_err(ExtractError::Corrupt)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(ExtractError::Corrupt)?;
        }
        let mut target = fs::File::create(&out)
            .with_context(|| format!("create {}", out.display()))
            .map_err(ExtractError::Corrupt)?;
        io::copy(&mut entry, &mut target)
            .with_context(|| format!("extract {}", out.display()))
            .map_err(ExtractError::Corrupt)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", out.display()))
                .map_err(ExtractError::Corrupt)?;
        }
    }
    Ok(())
}

fn escapes_root(path: &Path) -> bool {
    path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

fn unsafe_entry(path: &Path) -> ExtractError {
    ExtractError::Unsafe(eyre!(
        "archive entry '{}' escapes the extraction directory; refusing to install",
        path.display()
    ))
}

/// Moves the server tree to `<root>/mysql`.
///
/// Vendor archives wrap everything in one versioned directory
/// (`mysql-8.0.34-linux-glibc2.28-x86_64/`); flat archives are wrapped as-is.
fn normalise_layout(unpacked: &Path, root: &Path) -> Result<(), Report> {
    fs::create_dir(root).with_context(|| format!("create {}", root.display()))?;
    let server_dir = root.join(SERVER_DIR);
    let source = single_top_level_dir(unpacked)?.unwrap_or_else(|| unpacked.to_path_buf());
    fs::rename(&source, &server_dir)
        .with_context(|| format!("move {} to {}", source.display(), server_dir.display()))
}

fn single_top_level_dir(dir: &Path) -> Result<Option<PathBuf>, Report> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("list {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("list {}", dir.display()))?;
    if entries.len() != 1 {
        return Ok(None);
    }
    let Some(entry) = entries.pop() else {
        return Ok(None);
    };
    let is_dir = entry
        .file_type()
        .with_context(|| format!("inspect {}", entry.path().display()))?
        .is_dir();
    Ok(is_dir.then(|| entry.path()))
}

fn replace_destination(root: &Path, destination: &Utf8Path) -> Result<(), Report> {
    match fs::remove_dir_all(destination) {
        Ok(()) => debug!(target: LOG_TARGET, path = %destination, "replaced invalid cache entry"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("clear {destination}")),
    }
    fs::rename(root, destination)
        .with_context(|| format!("move staged binaries to {destination}"))
}

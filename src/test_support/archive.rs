//! Builds small in-memory server archives for acquisition tests.

use std::io::{self, Cursor, Write};

use flate2::{Compression, write::GzEncoder};

/// Script installed as the fake `mysqld`; it only needs to exist.
const FAKE_SERVER: &[u8] = b"#!/bin/sh\necho \"mysqld  Ver 8.0.34 for Linux on x86_64\"\n";

/// One regular file inside a generated archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path inside the archive, `/`-separated.
    pub path: String,
    /// File contents.
    pub contents: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
}

impl ArchiveEntry {
    /// Describes a regular file.
    #[must_use]
    pub fn file(path: &str, contents: &[u8], mode: u32) -> Self {
        Self {
            path: path.to_owned(),
            contents: contents.to_vec(),
            mode,
        }
    }

    /// Describes a minimal server distribution below `top`; an empty `top`
    /// produces a flat archive.
    #[must_use]
    pub fn server_tree(top: &str) -> Vec<Self> {
        let prefix = if top.is_empty() {
            String::new()
        } else {
            format!("{top}/")
        };
        vec![
            Self::file(
                &format!("{prefix}bin/mysqld{}", std::env::consts::EXE_SUFFIX),
                FAKE_SERVER,
                0o755,
            ),
            Self::file(&format!("{prefix}share/errmsg.sys"), b"messages", 0o644),
        ]
    }
}

/// Encodes `entries` as a gzip-compressed tarball.
///
/// # Errors
/// Returns an error when an entry path is rejected by the tar encoder.
pub fn gzip_tarball(entries: &[ArchiveEntry]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.contents.len() as u64);
        header.set_mode(entry.mode);
        header.set_cksum();
        builder.append_data(&mut header, &entry.path, entry.contents.as_slice())?;
    }
    builder.into_inner()?.finish()
}

/// Encodes `entries` as a zip archive.
///
/// # Errors
/// Returns an error when the zip writer fails.
pub fn zip_archive(entries: &[ArchiveEntry]) -> io::Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for entry in entries {
        let options = zip::write::SimpleFileOptions::default().unix_permissions(entry.mode);
        writer.start_file(entry.path.as_str(), options)?;
        writer.write_all(&entry.contents)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Builds a tarball whose only entry climbs out of the extraction root.
///
/// # Errors
/// Returns an error when compression fails.
pub fn traversal_tarball() -> io::Result<Vec<u8>> {
    let contents: &[u8] = b"escaped";
    let mut header = tar::Header::new_old();
    // `set_path` refuses `..`, so the raw name field is written directly.
    header
        .as_old_mut()
        .name
        .iter_mut()
        .zip(b"../escape.txt")
        .for_each(|(slot, byte)| *slot = *byte);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append(&header, contents)?;
    builder.into_inner()?.finish()
}

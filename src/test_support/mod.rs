//! Helpers shared by unit and integration tests.
//!
//! Not part of the stable API.

mod archive;
mod logging;

pub use archive::{ArchiveEntry, gzip_tarball, traversal_tarball, zip_archive};
pub use logging::{capture_logs, capture_warn_logs};

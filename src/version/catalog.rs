//! Bundled table of downloadable MySQL distributions.

use color_eyre::eyre::Context;
use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigResult;

use super::parse_version_req;

const BUNDLED_CATALOG: &str = include_str!("../../data/versions.json");

/// One downloadable server distribution.
///
/// Identity is `(version, arch, os)`; descriptors are never mutated after
/// the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryDescriptor {
    /// Server version shipped by the archive.
    pub version: Version,
    /// CPU architecture label (`x64`, `arm64`).
    pub arch: String,
    /// Operating system label (`linux`, `macos`, `windows`).
    pub os: String,
    /// Kernel versions the distribution runs on.
    #[serde(deserialize_with = "deserialize_range")]
    pub kernel: VersionReq,
    /// HTTPS location of the archive.
    pub url: String,
    /// Optional hex-encoded SHA-256 of the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BinaryDescriptor {
    /// Returns the archive's file name, the final URL path segment.
    #[must_use]
    pub fn archive_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Ordered collection of [`BinaryDescriptor`] values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionCatalog {
    descriptors: Vec<BinaryDescriptor>,
}

impl VersionCatalog {
    /// Loads the catalog compiled into the crate.
    ///
    /// # Errors
    ///
    /// Returns an error when the embedded JSON is malformed.
    pub fn bundled() -> ConfigResult<Self> {
        Self::from_json(BUNDLED_CATALOG)
    }

    /// Parses a catalog from a JSON array of descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON is malformed or a range is invalid.
    pub fn from_json(raw: &str) -> ConfigResult<Self> {
        let descriptors: Vec<BinaryDescriptor> =
            serde_json::from_str(raw).context("parse MySQL version catalog")?;
        Ok(Self { descriptors })
    }

    /// Wraps caller-supplied descriptors.
    #[must_use]
    pub const fn new(descriptors: Vec<BinaryDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Returns the descriptors in catalog order.
    #[must_use]
    pub fn descriptors(&self) -> &[BinaryDescriptor] {
        &self.descriptors
    }
}

fn deserialize_range<'de, D>(deserializer: D) -> Result<VersionReq, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_version_req(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalog_covers_every_supported_platform() {
        let catalog = VersionCatalog::bundled().expect("bundled catalog parses");
        for (os, arch) in [
            ("linux", "x64"),
            ("linux", "arm64"),
            ("macos", "arm64"),
            ("windows", "x64"),
        ] {
            assert!(
                catalog
                    .descriptors()
                    .iter()
                    .any(|d| d.os == os && d.arch == arch),
                "missing {os}/{arch}"
            );
        }
    }

    #[test]
    fn hyphenated_kernel_ranges_are_inclusive() {
        let catalog = VersionCatalog::from_json(
            r#"[{"version":"8.0.34","arch":"x64","os":"linux",
                 "kernel":"4.0.0 - 6.0.0","url":"https://example.test/a.tar.gz"}]"#,
        )
        .expect("catalog parses");
        let descriptor = catalog.descriptors().first().expect("one descriptor");

        assert!(descriptor.kernel.matches(&Version::new(6, 0, 0)));
        assert!(!descriptor.kernel.matches(&Version::new(6, 0, 1)));
        assert!(descriptor.sha256.is_none());
    }

    #[test]
    fn malformed_range_is_rejected() {
        let err = VersionCatalog::from_json(
            r#"[{"version":"8.0.34","arch":"x64","os":"linux",
                 "kernel":"newish","url":"https://example.test/a.tar.gz"}]"#,
        )
        .expect_err("bad range must fail");
        assert!(format!("{err:?}").contains("newish"));
    }

    #[test]
    fn archive_name_strips_query() {
        let descriptor = BinaryDescriptor {
            version: Version::new(8, 0, 34),
            arch: "x64".into(),
            os: "windows".into(),
            kernel: VersionReq::STAR,
            url: "https://cdn.example.test/mysql-8.0.34-winx64.zip?sig=abc".into(),
            sha256: None,
        };
        assert_eq!(descriptor.archive_name(), "mysql-8.0.34-winx64.zip");
    }
}

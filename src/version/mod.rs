//! Version catalog, host platform detection, and candidate resolution.
//!
//! Requested versions and catalog kernel ranges share one parser so that
//! loose forms (`8.0`, `8.0.x`, `4.0.0 - 6.0.0`) behave the same everywhere.

mod catalog;
mod host;
mod resolve;

pub use catalog::{BinaryDescriptor, VersionCatalog};
pub use host::Platform;
pub use resolve::{Constraints, resolve};

use color_eyre::eyre::eyre;
use semver::{Version, VersionReq};

use crate::error::{ConfigError, ConfigResult};

/// Parses a version requirement, accepting bare and hyphenated forms.
///
/// A full version such as `8.0.34` is exact, a partial one such as `8.0`
/// matches its patch series, and `A - B` is an inclusive range. Anything
/// else is handed to [`VersionReq::parse`].
///
/// # Errors
///
/// Returns a [`ConfigError`] naming the rejected input.
///
/// # Examples
///
/// ```
/// use mysql_memory_server::version::parse_version_req;
/// use semver::Version;
///
/// let req = parse_version_req("4.0.0 - 6.0.0").expect("valid range");
/// assert!(req.matches(&Version::new(5, 10, 0)));
/// assert!(!req.matches(&Version::new(6, 1, 0)));
/// ```
pub fn parse_version_req(raw: &str) -> ConfigResult<VersionReq> {
    let trimmed = raw.trim();
    let normalised = if let Some((low, high)) = trimmed.split_once(" - ") {
        format!(">={}, <={}", low.trim(), high.trim())
    } else if is_bare_version(trimmed) {
        format!("={trimmed}")
    } else {
        trimmed.to_owned()
    };
    VersionReq::parse(&normalised)
        .map_err(|err| ConfigError::from(eyre!("invalid version requirement '{raw}': {err}")))
}

/// Coerces a loosely formatted version (a kernel release, a `--version`
/// banner token) into `major.minor.patch`.
///
/// Leading non-digits are skipped, at most three numeric components are
/// kept, and missing ones default to zero.
///
/// # Examples
///
/// ```
/// use mysql_memory_server::version::coerce_version;
/// use semver::Version;
///
/// assert_eq!(
///     coerce_version("5.15.153.1-microsoft-standard-WSL2"),
///     Some(Version::new(5, 15, 153)),
/// );
/// ```
#[must_use]
pub fn coerce_version(raw: &str) -> Option<Version> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let tail = raw.get(start..)?;
    let end = tail
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(tail.len());
    let mut parts = tail
        .get(..end)?
        .split('.')
        .filter(|part| !part.is_empty())
        .map(str::parse::<u64>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(Result::ok).unwrap_or(0);
    let patch = parts.next().and_then(Result::ok).unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

fn is_bare_version(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("8.0.34", "8.0.34", true)]
    #[case("8.0.34", "8.0.35", false)]
    #[case("8.0", "8.0.39", true)]
    #[case("8.0", "8.4.2", false)]
    #[case("8.0.x", "8.0.1", true)]
    #[case("^8", "8.4.2", true)]
    #[case("^8", "9.0.1", false)]
    #[case(">=8.0.0, <8.4.0", "8.0.39", true)]
    #[case("4.0.0 - 6.0.0", "6.0.0", true)]
    #[case("4.0.0 - 6.0.0", "3.10.0", false)]
    fn requirement_forms(#[case] raw: &str, #[case] candidate: &str, #[case] expected: bool) {
        let req = parse_version_req(raw).expect("valid requirement");
        let version = Version::parse(candidate).expect("valid version");
        assert_eq!(req.matches(&version), expected, "{raw} vs {candidate}");
    }

    #[test]
    fn invalid_requirement_names_input() {
        let err = parse_version_req("eight").expect_err("rejects words");
        assert!(err.to_string().contains("eight"));
    }

    #[rstest]
    #[case("6.8.0-45-generic", Some(Version::new(6, 8, 0)))]
    #[case("5.15.153.1-microsoft-standard-WSL2", Some(Version::new(5, 15, 153)))]
    #[case("23.4.0", Some(Version::new(23, 4, 0)))]
    #[case("5.10", Some(Version::new(5, 10, 0)))]
    #[case("Ver 8.0.34 for Linux", Some(Version::new(8, 0, 34)))]
    #[case("unknown", None)]
    fn coerces_loose_versions(#[case] raw: &str, #[case] expected: Option<Version>) {
        assert_eq!(coerce_version(raw), expected);
    }
}

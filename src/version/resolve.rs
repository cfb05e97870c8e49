//! Staged filtering of the catalog down to acceptable descriptors.

use color_eyre::eyre::eyre;
use semver::VersionReq;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ResolutionAxis, ServerError, ServerResult};

use super::{BinaryDescriptor, Platform, VersionCatalog};

const LOG_TARGET: &str = "mysql_memory::resolve";

/// Requirements a descriptor must meet.
#[derive(Debug, Clone)]
pub struct Constraints {
    /// Version range; `None` accepts any version.
    pub version: Option<VersionReq>,
    /// Platform to match.
    pub platform: Platform,
    /// Accept every kernel when none of the candidates supports the host's.
    pub ignore_unsupported_system_version: bool,
}

/// Selects the descriptors satisfying `constraints`, newest first.
///
/// Stages run in a fixed order (architecture, operating system, kernel,
/// version) and the first stage that leaves nothing fails with an error
/// naming its axis. Equal versions keep catalog order.
///
/// # Errors
///
/// Returns [`ErrorKind::UnsupportedPlatform`] carrying the eliminating axis.
pub fn resolve(
    catalog: &VersionCatalog,
    constraints: &Constraints,
) -> ServerResult<Vec<BinaryDescriptor>> {
    let platform = &constraints.platform;

    let by_arch = stage(
        catalog.descriptors().iter().collect(),
        ResolutionAxis::Architecture,
        |d| d.arch == platform.arch,
        || {
            format!(
                "no MySQL distribution is published for CPU architecture '{}'; \
                 set an architecture override if the host can emulate another one",
                platform.arch
            )
        },
    )?;

    let by_os = stage(
        by_arch,
        ResolutionAxis::OperatingSystem,
        |d| d.os == platform.os,
        || {
            format!(
                "no MySQL distribution is published for {} on '{}'",
                platform.os, platform.arch
            )
        },
    )?;

    let by_kernel = filter_kernel(by_os, constraints)?;

    let mut by_version = match &constraints.version {
        Some(req) => stage(
            by_kernel,
            ResolutionAxis::Version,
            |d| req.matches(&d.version),
            || {
                format!(
                    "no MySQL version matching '{req}' is available for {} on '{}'",
                    platform.os, platform.arch
                )
            },
        )?,
        None => by_kernel,
    };

    by_version.sort_by(|a, b| b.version.cmp(&a.version));
    let resolved: Vec<BinaryDescriptor> = by_version.into_iter().cloned().collect();
    debug!(
        target: LOG_TARGET,
        candidates = resolved.len(),
        primary = ?resolved.first().map(|d| d.version.to_string()),
        "resolved MySQL distributions"
    );
    Ok(resolved)
}

fn filter_kernel<'a>(
    candidates: Vec<&'a BinaryDescriptor>,
    constraints: &Constraints,
) -> ServerResult<Vec<&'a BinaryDescriptor>> {
    let Some(kernel) = constraints.platform.kernel.as_ref() else {
        return Ok(candidates);
    };
    let supported: Vec<&BinaryDescriptor> = candidates
        .iter()
        .copied()
        .filter(|d| d.kernel.matches(kernel))
        .collect();
    if !supported.is_empty() {
        return Ok(supported);
    }
    if constraints.ignore_unsupported_system_version {
        warn!(
            target: LOG_TARGET,
            kernel = %kernel,
            "host kernel is outside every supported range; continuing because the override is set"
        );
        return Ok(candidates);
    }
    Err(axis_error(
        ResolutionAxis::Kernel,
        format!(
            "kernel {kernel} is outside the supported range of every MySQL distribution for {}; \
             enable the unsupported system version override to try anyway",
            constraints.platform.os
        ),
    ))
}

fn stage<'a>(
    candidates: Vec<&'a BinaryDescriptor>,
    axis: ResolutionAxis,
    keep: impl Fn(&BinaryDescriptor) -> bool,
    explain: impl FnOnce() -> String,
) -> ServerResult<Vec<&'a BinaryDescriptor>> {
    let kept: Vec<&BinaryDescriptor> = candidates.into_iter().filter(|d| keep(d)).collect();
    if kept.is_empty() {
        return Err(axis_error(axis, explain()));
    }
    Ok(kept)
}

fn axis_error(axis: ResolutionAxis, message: String) -> ServerError {
    debug!(target: LOG_TARGET, axis = axis.as_str(), "resolution stage left no candidates");
    ServerError::new(ErrorKind::UnsupportedPlatform(axis), eyre!(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use semver::Version;

    fn descriptor(version: &str, arch: &str, os: &str, kernel: &str) -> BinaryDescriptor {
        BinaryDescriptor {
            version: Version::parse(version).expect("version"),
            arch: arch.into(),
            os: os.into(),
            kernel: crate::version::parse_version_req(kernel).expect("range"),
            url: format!("https://example.test/mysql-{version}-{os}-{arch}.tar.xz"),
            sha256: None,
        }
    }

    #[fixture]
    fn catalog() -> VersionCatalog {
        VersionCatalog::new(vec![
            descriptor("8.0.34", "x64", "linux", "4.0.0 - 6.0.0"),
            descriptor("8.4.2", "x64", "linux", ">=4.18.0"),
            descriptor("8.0.39", "x64", "linux", ">=4.18.0"),
            descriptor("8.4.2", "arm64", "macos", ">=23.0.0"),
        ])
    }

    fn linux(kernel: &str) -> Platform {
        Platform {
            os: "linux".into(),
            arch: "x64".into(),
            kernel: Some(Version::parse(kernel).expect("kernel")),
        }
    }

    fn constraints(version: Option<&str>, platform: Platform) -> Constraints {
        Constraints {
            version: version.map(|raw| crate::version::parse_version_req(raw).expect("req")),
            platform,
            ignore_unsupported_system_version: false,
        }
    }

    #[rstest]
    fn newest_first(catalog: VersionCatalog) {
        let resolved = resolve(&catalog, &constraints(None, linux("5.10.0"))).expect("resolve");
        let versions: Vec<String> = resolved.iter().map(|d| d.version.to_string()).collect();
        assert_eq!(versions, ["8.4.2", "8.0.39", "8.0.34"]);
    }

    #[rstest]
    fn kernel_range_excludes_newer_hosts(catalog: VersionCatalog) {
        let resolved =
            resolve(&catalog, &constraints(Some("8.0.x"), linux("6.8.0"))).expect("resolve");
        let versions: Vec<String> = resolved.iter().map(|d| d.version.to_string()).collect();
        assert_eq!(versions, ["8.0.39"]);
    }

    #[rstest]
    #[case::arch(
        Platform { os: "linux".into(), arch: "riscv64".into(), kernel: None },
        None,
        ResolutionAxis::Architecture
    )]
    #[case::os(
        Platform { os: "windows".into(), arch: "x64".into(), kernel: None },
        None,
        ResolutionAxis::OperatingSystem
    )]
    #[case::kernel(linux("3.10.0"), None, ResolutionAxis::Kernel)]
    #[case::version(linux("5.10.0"), Some("^9"), ResolutionAxis::Version)]
    fn each_axis_reports_itself(
        catalog: VersionCatalog,
        #[case] platform: Platform,
        #[case] version: Option<&str>,
        #[case] axis: ResolutionAxis,
    ) {
        let err = resolve(&catalog, &constraints(version, platform)).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform(axis));
    }

    #[rstest]
    fn override_skips_kernel_stage(catalog: VersionCatalog) {
        let mut request = constraints(None, linux("3.10.0"));
        request.ignore_unsupported_system_version = true;

        let resolved = resolve(&catalog, &request).expect("override accepts host");

        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn equal_versions_keep_catalog_order() {
        let first = descriptor("8.0.34", "x64", "linux", "*");
        let mut second = descriptor("8.0.34", "x64", "linux", "*");
        second.url = "https://mirror.example.test/mysql-8.0.34.tar.xz".into();
        let catalog = VersionCatalog::new(vec![first.clone(), second.clone()]);

        let resolved = resolve(&catalog, &constraints(None, linux("5.10.0"))).expect("resolve");

        assert_eq!(resolved, vec![first, second]);
    }
}

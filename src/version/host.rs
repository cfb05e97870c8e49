//! Host platform detection.

use semver::Version;

/// Platform facts the resolver filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Operating system label (`linux`, `macos`, `windows`).
    pub os: String,
    /// CPU architecture label (`x64`, `arm64`).
    pub arch: String,
    /// Kernel release, `None` when the host does not report one.
    pub kernel: Option<Version>,
}

impl Platform {
    /// Describes the running host, optionally overriding the architecture.
    #[must_use]
    pub fn detect(arch_override: Option<&str>) -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            arch: normalise_arch(arch_override.unwrap_or(std::env::consts::ARCH)),
            kernel: kernel_release(),
        }
    }
}

/// Maps toolchain and vendor spellings onto catalog architecture labels.
pub(crate) fn normalise_arch(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => "x64".to_owned(),
        "aarch64" | "arm64" => "arm64".to_owned(),
        other => other.to_owned(),
    }
}

#[cfg(unix)]
fn kernel_release() -> Option<Version> {
    let uts = nix::sys::utsname::uname().ok()?;
    super::coerce_version(&uts.release().to_string_lossy())
}

#[cfg(not(unix))]
const fn kernel_release() -> Option<Version> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("x86_64", "x64")]
    #[case("AMD64", "x64")]
    #[case("aarch64", "arm64")]
    #[case("arm64", "arm64")]
    #[case("riscv64", "riscv64")]
    fn architecture_labels(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalise_arch(raw), expected);
    }

    #[test]
    fn override_replaces_host_architecture() {
        let platform = Platform::detect(Some("aarch64"));
        assert_eq!(platform.arch, "arm64");
        assert_eq!(platform.os, std::env::consts::OS);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_reports_a_kernel_release() {
        assert!(Platform::detect(None).kernel.is_some());
    }
}

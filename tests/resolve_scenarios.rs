//! Resolution against hand-written catalogs and the bundled one.

use mysql_memory_server::test_support::capture_warn_logs;
use mysql_memory_server::version::{Constraints, Platform, VersionCatalog, resolve};
use mysql_memory_server::{ErrorKind, ResolutionAxis, ServerOptions};
use rstest::{fixture, rstest};
use semver::Version;

const CATALOG: &str = r#"[
  {"version": "8.0.34", "arch": "x64", "os": "linux", "kernel": "4.0.0 - 6.0.0",
   "url": "https://example.invalid/mysql-8.0.34-linux-glibc2.28-x86_64.tar.xz"},
  {"version": "8.0.33", "arch": "x64", "os": "linux", "kernel": "4.0.0 - 6.0.0",
   "url": "https://example.invalid/mysql-8.0.33-linux-glibc2.28-x86_64.tar.xz"},
  {"version": "8.4.2", "arch": "x64", "os": "linux", "kernel": ">=6.1.0",
   "url": "https://example.invalid/mysql-8.4.2-linux-glibc2.28-x86_64.tar.xz"}
]"#;

#[fixture]
fn catalog() -> VersionCatalog {
    VersionCatalog::from_json(CATALOG).expect("catalog")
}

fn constraints(range: &str, kernel: &str) -> Constraints {
    let options = ServerOptions::default()
        .with_version(range)
        .expect("version range");
    Constraints {
        version: options.version,
        platform: Platform {
            os: "linux".into(),
            arch: "x64".into(),
            kernel: Some(Version::parse(kernel).expect("kernel")),
        },
        ignore_unsupported_system_version: false,
    }
}

#[rstest]
fn wildcard_range_picks_newest_compatible(catalog: VersionCatalog) {
    let resolved = resolve(&catalog, &constraints("8.0.x", "5.10.0")).expect("resolve");

    let versions: Vec<String> = resolved.iter().map(|d| d.version.to_string()).collect();
    assert_eq!(versions, ["8.0.34", "8.0.33"]);
    assert!(
        resolved
            .first()
            .expect("candidate")
            .url
            .ends_with("mysql-8.0.34-linux-glibc2.28-x86_64.tar.xz")
    );
}

#[rstest]
fn newer_kernel_selects_newer_series(catalog: VersionCatalog) {
    let resolved = resolve(&catalog, &constraints("8.x", "6.8.0")).expect("resolve");
    assert_eq!(
        resolved.first().map(|d| d.version.clone()),
        Some(Version::new(8, 4, 2))
    );
}

#[rstest]
fn kernel_outside_every_range_is_reported(catalog: VersionCatalog) {
    let err = resolve(&catalog, &constraints("8.0.x", "3.10.0")).expect_err("unsupported");
    assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform(ResolutionAxis::Kernel));
}

#[rstest]
fn ignoring_the_kernel_check_warns_and_continues(catalog: VersionCatalog) {
    let relaxed = Constraints {
        ignore_unsupported_system_version: true,
        ..constraints("8.0.x", "3.10.0")
    };

    let (logs, resolved) = capture_warn_logs(|| resolve(&catalog, &relaxed));

    let resolved = resolved.expect("resolve despite kernel");
    assert_eq!(resolved.len(), 2);
    assert!(!logs.is_empty());
}

#[test]
fn bundled_catalog_resolves_for_linux_hosts() {
    let catalog = VersionCatalog::bundled().expect("bundled catalog");
    let resolved = resolve(
        &catalog,
        &Constraints {
            version: None,
            platform: Platform {
                os: "linux".into(),
                arch: "x64".into(),
                kernel: Some(Version::new(6, 8, 0)),
            },
            ignore_unsupported_system_version: false,
        },
    )
    .expect("resolve bundled");

    assert!(!resolved.is_empty());
    assert!(resolved.windows(2).all(|pair| match pair {
        [newer, older] => newer.version >= older.version,
        _ => true,
    }));
}

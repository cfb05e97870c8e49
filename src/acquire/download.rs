//! Streaming archive downloads into the cache directory.

use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{Context, Report, eyre};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::version::BinaryDescriptor;

const LOG_TARGET: &str = "mysql_memory::acquire";

/// Generous per-request timeout; server archives run to several hundred MB.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(900);

const USER_AGENT: &str = concat!("mysql-memory-server/", env!("CARGO_PKG_VERSION"));

/// Why a single download attempt failed.
#[derive(Debug)]
pub(crate) enum FetchError {
    /// The server answered 404; retrying the same URL cannot help.
    NotFound(Report),
    /// Transport failure, unexpected status, or checksum mismatch.
    Failed(Report),
}

/// Builds the HTTP client shared by every attempt.
pub(crate) fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
}

/// Downloads the descriptor's archive into a temporary file inside `dir`.
///
/// The file is deleted when the returned handle drops, so an abandoned
/// attempt never leaves a partial archive behind.
pub(crate) async fn fetch_archive(
    client: &Client,
    descriptor: &BinaryDescriptor,
    dir: &Utf8Path,
) -> Result<NamedTempFile, FetchError> {
    let url = descriptor.url.as_str();
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|err| FetchError::Failed(eyre!("request to {url} failed: {err}")))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(eyre!(
            "{url} returned 404; MySQL {} is no longer published at this location",
            descriptor.version
        )));
    }
    if !status.is_success() {
        return Err(FetchError::Failed(eyre!("{url} returned HTTP {status}")));
    }

    let archive = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(dir)
        .with_context(|| format!("create download file in {dir}"))
        .map_err(FetchError::Failed)?;
    let std_file = archive
        .reopen()
        .context("open download file for writing")
        .map_err(FetchError::Failed)?;
    let mut file = tokio::fs::File::from_std(std_file);
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| FetchError::Failed(eyre!("reading {url} failed: {err}")))?
    {
        hasher.update(&chunk);
        received = received.saturating_add(chunk.len() as u64);
        file.write_all(&chunk)
            .await
            .context("write downloaded bytes")
            .map_err(FetchError::Failed)?;
    }
    file.flush()
        .await
        .context("flush downloaded archive")
        .map_err(FetchError::Failed)?;

    verify_checksum(descriptor, &hasher.finalize()).map_err(FetchError::Failed)?;
    debug!(
        target: LOG_TARGET,
        url,
        bytes = received,
        path = %archive.path().display(),
        "downloaded archive"
    );
    Ok(archive)
}

fn verify_checksum(descriptor: &BinaryDescriptor, digest: &[u8]) -> Result<(), Report> {
    let Some(expected) = descriptor.sha256.as_deref() else {
        return Ok(());
    };
    let actual = to_hex(digest);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(eyre!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            descriptor.url
        ))
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::{Version, VersionReq};
    use tempfile::tempdir;

    fn descriptor(url: String, sha256: Option<&str>) -> BinaryDescriptor {
        BinaryDescriptor {
            version: Version::new(8, 0, 34),
            arch: "x64".into(),
            os: "linux".into(),
            kernel: VersionReq::STAR,
            url,
            sha256: sha256.map(str::to_owned),
        }
    }

    fn utf8(temp: &tempfile::TempDir) -> &Utf8Path {
        Utf8Path::from_path(temp.path()).expect("utf8 path")
    }

    #[tokio::test]
    async fn downloads_body_to_temp_file() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/mysql.tar.gz")
            .with_body("archive-bytes")
            .create_async()
            .await;
        let temp = tempdir().expect("tempdir");
        let client = build_client().expect("client");

        let archive = fetch_archive(
            &client,
            &descriptor(format!("{}/mysql.tar.gz", server.url()), None),
            utf8(&temp),
        )
        .await
        .expect("download succeeds");

        assert_eq!(
            std::fs::read(archive.path()).expect("read archive"),
            b"archive-bytes"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_distinguished() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gone.tar.gz")
            .with_status(404)
            .create_async()
            .await;
        let temp = tempdir().expect("tempdir");
        let client = build_client().expect("client");

        let err = fetch_archive(
            &client,
            &descriptor(format!("{}/gone.tar.gz", server.url()), None),
            utf8(&temp),
        )
        .await
        .expect_err("404 must fail");

        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/busy.tar.gz")
            .with_status(503)
            .create_async()
            .await;
        let temp = tempdir().expect("tempdir");
        let client = build_client().expect("client");

        let err = fetch_archive(
            &client,
            &descriptor(format!("{}/busy.tar.gz", server.url()), None),
            utf8(&temp),
        )
        .await
        .expect_err("503 must fail");

        assert!(matches!(err, FetchError::Failed(_)));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_removes_file() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/mysql.tar.gz")
            .with_body("tampered")
            .create_async()
            .await;
        let temp = tempdir().expect("tempdir");
        let client = build_client().expect("client");

        let err = fetch_archive(
            &client,
            &descriptor(format!("{}/mysql.tar.gz", server.url()), Some("00ff")),
            utf8(&temp),
        )
        .await
        .expect_err("checksum mismatch must fail");

        assert!(matches!(err, FetchError::Failed(ref report) if report.to_string().contains("checksum")));
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn matching_checksum_is_case_insensitive() {
        let digest = Sha256::digest(b"abc");
        let expected = to_hex(&digest).to_ascii_uppercase();
        let desc = descriptor("https://example.test/a.zip".into(), Some(&expected));
        verify_checksum(&desc, &digest).expect("checksum matches");
    }
}

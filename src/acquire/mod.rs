//! Turns resolved descriptors into a local server executable.
//!
//! In shared mode each version is extracted once into the binary cache
//! under a [`DirLock`]; concurrent acquirers wait for the holder and reuse
//! its result. In isolated mode every acquisition downloads into its own
//! uniquely named directory, which teardown later removes.

mod download;
mod extract;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Report, eyre};
use reqwest::Client;
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::cache::{
    CacheLookupResult, DirLock, LockAttempt, LockPolicy, SERVER_DIR, check_cache, executable_path,
    version_root,
};
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::fs::ensure_dir_exists;
use crate::options::ServerOptions;
use crate::version::BinaryDescriptor;

use download::{FetchError, build_client, fetch_archive};
use extract::{ArchiveFormat, ExtractError, install_archive};

const LOG_TARGET: &str = "mysql_memory::acquire";

/// Pause between download attempts for one descriptor.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Directory under the cache root holding isolated downloads.
const ISOLATED_DIR: &str = "isolated";

/// A server binary ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredBinary {
    /// Version of the server.
    pub version: Version,
    /// Path to `mysqld`.
    pub executable: Utf8PathBuf,
    /// Directory passed as `--basedir` (the parent of `bin/`).
    pub basedir: Utf8PathBuf,
    /// Private download directory removed at teardown, for isolated mode.
    pub isolated_root: Option<Utf8PathBuf>,
}

impl AcquiredBinary {
    fn from_root(version: Version, root: &Utf8Path, isolated: bool) -> Self {
        Self {
            version,
            executable: executable_path(root),
            basedir: root.join(SERVER_DIR),
            isolated_root: isolated.then(|| root.to_path_buf()),
        }
    }
}

/// Settings governing acquisition.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Root of the binary cache.
    pub cache_dir: Utf8PathBuf,
    /// Download retries per descriptor after the first attempt.
    pub download_retries: u32,
    /// Share extractions through the cache.
    pub download_binary_once: bool,
    /// Polling budget while a peer holds a version lock.
    pub lock_policy: LockPolicy,
}

impl From<&ServerOptions> for AcquireOptions {
    fn from(options: &ServerOptions) -> Self {
        Self {
            cache_dir: options.binary_cache_dir.clone(),
            download_retries: options.download_retries,
            download_binary_once: options.download_binary_once,
            lock_policy: LockPolicy {
                retries: options.lock_retries,
                retry_wait: options.lock_retry_wait,
            },
        }
    }
}

/// Why acquiring one descriptor failed.
#[derive(Debug)]
enum AcquireFailure {
    /// The archive does not exist remotely; the next descriptor may.
    NotFound(Report),
    /// Terminal failure for this acquisition.
    Fatal(ServerError),
}

impl From<ServerError> for AcquireFailure {
    fn from(err: ServerError) -> Self {
        Self::Fatal(err)
    }
}

/// Downloads and caches server binaries.
#[derive(Debug, Clone)]
pub struct BinaryAcquirer {
    client: Client,
    options: AcquireOptions,
}

impl BinaryAcquirer {
    /// Creates an acquirer with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS backend cannot be initialised.
    pub fn new(options: AcquireOptions) -> ServerResult<Self> {
        let client = build_client().map_err(|err| {
            ServerError::new(ErrorKind::Download, eyre!("failed to build HTTP client: {err}"))
        })?;
        Ok(Self { client, options })
    }

    /// Returns an executable for the first usable descriptor.
    ///
    /// A 404 on the primary descriptor moves on to the next one, once;
    /// every other failure is retried against the same descriptor only.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ArtifactMissing`] when neither descriptor
    /// exists remotely, [`ErrorKind::Download`] once retries run out,
    /// [`ErrorKind::Extraction`] for unsafe archives,
    /// [`ErrorKind::LockTimeout`] when a peer holds the lock too long, and
    /// [`ErrorKind::Cancelled`] when `cancel` fires.
    pub async fn acquire(
        &self,
        descriptors: &[BinaryDescriptor],
        cancel: &CancellationToken,
    ) -> ServerResult<AcquiredBinary> {
        let Some(primary) = descriptors.first() else {
            return Err(ServerError::new(
                ErrorKind::ArtifactMissing,
                eyre!("no MySQL distribution was selected for download"),
            ));
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ServerError::new(
                ErrorKind::Cancelled,
                eyre!("binary acquisition cancelled"),
            )),
            result = self.acquire_with_fallback(primary, descriptors.get(1)) => result,
        }
    }

    async fn acquire_with_fallback(
        &self,
        primary: &BinaryDescriptor,
        fallback: Option<&BinaryDescriptor>,
    ) -> ServerResult<AcquiredBinary> {
        let primary_missing = match self.acquire_descriptor(primary).await {
            Ok(binary) => return Ok(binary),
            Err(AcquireFailure::Fatal(err)) => return Err(err),
            Err(AcquireFailure::NotFound(report)) => report,
        };
        let Some(next) = fallback else {
            return Err(artifact_missing(primary_missing));
        };
        warn!(
            target: LOG_TARGET,
            missing = %primary.version,
            fallback = %next.version,
            error = %primary_missing,
            "primary archive is missing; trying the next candidate"
        );
        match self.acquire_descriptor(next).await {
            Ok(binary) => Ok(binary),
            Err(AcquireFailure::Fatal(err)) => Err(err),
            Err(AcquireFailure::NotFound(report)) => Err(artifact_missing(report)),
        }
    }

    async fn acquire_descriptor(
        &self,
        descriptor: &BinaryDescriptor,
    ) -> Result<AcquiredBinary, AcquireFailure> {
        let span = info_span!(
            target: LOG_TARGET,
            "acquire",
            version = %descriptor.version,
            shared = self.options.download_binary_once
        );
        async {
            if self.options.download_binary_once {
                self.acquire_shared(descriptor).await
            } else {
                self.acquire_isolated(descriptor).await
            }
        }
        .instrument(span)
        .await
    }

    async fn acquire_shared(
        &self,
        descriptor: &BinaryDescriptor,
    ) -> Result<AcquiredBinary, AcquireFailure> {
        let root = version_root(&self.options.cache_dir, &descriptor.version);
        loop {
            if let CacheLookupResult::Hit { .. } =
                check_cache(&self.options.cache_dir, &descriptor.version)
            {
                return Ok(AcquiredBinary::from_root(descriptor.version.clone(), &root, false));
            }
            match DirLock::try_acquire(&root).await? {
                LockAttempt::Acquired(lock) => {
                    let result = self.populate_locked(descriptor, &root).await;
                    if let Err(err) = lock.release() {
                        warn!(target: LOG_TARGET, error = %err, "failed to release cache lock");
                    }
                    return result;
                }
                LockAttempt::Held => {
                    info!(
                        target: LOG_TARGET,
                        version = %descriptor.version,
                        "another process is preparing this version; waiting"
                    );
                    DirLock::wait_until_released(&root, self.options.lock_policy).await?;
                }
            }
        }
    }

    async fn populate_locked(
        &self,
        descriptor: &BinaryDescriptor,
        root: &Utf8Path,
    ) -> Result<AcquiredBinary, AcquireFailure> {
        // A peer may have finished between our cache check and lock creation.
        if let CacheLookupResult::Hit { .. } =
            check_cache(&self.options.cache_dir, &descriptor.version)
        {
            return Ok(AcquiredBinary::from_root(descriptor.version.clone(), root, false));
        }
        self.download_with_retries(descriptor, root).await?;
        Ok(AcquiredBinary::from_root(descriptor.version.clone(), root, false))
    }

    async fn acquire_isolated(
        &self,
        descriptor: &BinaryDescriptor,
    ) -> Result<AcquiredBinary, AcquireFailure> {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let root = self
            .options
            .cache_dir
            .join(ISOLATED_DIR)
            .join(format!("{}-{unique}", descriptor.version));
        self.download_with_retries(descriptor, &root).await?;
        Ok(AcquiredBinary::from_root(descriptor.version.clone(), &root, true))
    }

    async fn download_with_retries(
        &self,
        descriptor: &BinaryDescriptor,
        root: &Utf8Path,
    ) -> Result<(), AcquireFailure> {
        let format = ArchiveFormat::from_name(descriptor.archive_name()).ok_or_else(|| {
            ServerError::new(
                ErrorKind::Extraction,
                eyre!(
                    "cannot tell the archive format of {}; expected .tar.gz, .tgz, .tar.xz or .zip",
                    descriptor.url
                ),
            )
        })?;
        let parent = root
            .parent()
            .ok_or_else(|| ServerError::from(eyre!("{root} has no parent directory")))?;
        ensure_dir_exists(parent).map_err(ServerError::from)?;

        let attempts = self.options.download_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let last = match self.download_once(descriptor, format, root).await {
                Ok(()) => {
                    info!(
                        target: LOG_TARGET,
                        version = %descriptor.version,
                        path = %root,
                        "MySQL binaries ready"
                    );
                    return Ok(());
                }
                Err(AttemptError::NotFound(report)) => return Err(AcquireFailure::NotFound(report)),
                Err(AttemptError::Fatal(err)) => return Err(AcquireFailure::Fatal(err)),
                Err(AttemptError::Retryable(report)) => report,
            };
            if attempt >= attempts {
                return Err(AcquireFailure::Fatal(ServerError::new(
                    ErrorKind::Download,
                    eyre!(
                        "failed to download MySQL {} from {} after {attempts} attempts; \
                         last error: {last:#}. Check network access to the download host",
                        descriptor.version,
                        descriptor.url
                    ),
                )));
            }
            warn!(
                target: LOG_TARGET,
                version = %descriptor.version,
                attempt,
                error = %last,
                "download attempt failed; retrying"
            );
            attempt += 1;
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    async fn download_once(
        &self,
        descriptor: &BinaryDescriptor,
        format: ArchiveFormat,
        root: &Utf8Path,
    ) -> Result<(), AttemptError> {
        let parent = root.parent().unwrap_or(root);
        let archive = fetch_archive(&self.client, descriptor, parent)
            .await
            .map_err(|err| match err {
                FetchError::NotFound(report) => AttemptError::NotFound(report),
                FetchError::Failed(report) => AttemptError::Retryable(report),
            })?;

        let archive_path = archive.path().to_path_buf();
        let destination = root.to_path_buf();
        let extraction = tokio::task::spawn_blocking(move || {
            install_archive(&archive_path, format, &destination)
        })
        .await
        .map_err(|err| AttemptError::Retryable(eyre!("extraction task failed: {err}")))?;
        drop(archive);

        extraction.map_err(|err| match err {
            ExtractError::Unsafe(report) => {
                AttemptError::Fatal(ServerError::new(ErrorKind::Extraction, report))
            }
            ExtractError::Corrupt(report) => AttemptError::Retryable(report),
        })
    }
}

#[derive(Debug)]
enum AttemptError {
    NotFound(Report),
    Retryable(Report),
    Fatal(ServerError),
}

fn artifact_missing(report: Report) -> ServerError {
    ServerError::new(
        ErrorKind::ArtifactMissing,
        eyre!("no candidate MySQL archive is available for download: {report:#}"),
    )
}

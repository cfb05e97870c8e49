//! Cross-process locking for cache coordination.
//!
//! A lock is a directory named `<target>.lock`. Directory creation is atomic,
//! so exactly one contender wins; the winner touches the directory's
//! modification time every [`HEARTBEAT_INTERVAL`] while it holds the lock. A
//! lock whose heartbeat is older than [`STALE_AFTER`] belonged to a process
//! that died and is reclaimed by the next contender.
//!
//! Reclaimers serialise on a second directory, `<target>.lock.reclaim`, and
//! repeat the staleness check while holding it. A contender acting on an
//! old reading therefore never deletes a lock a peer has just re-created.

use std::io::{self, ErrorKind};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use filetime::FileTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ErrorKind as ServerErrorKind, ServerError, ServerResult};
use crate::fs::ensure_dir_exists;

/// Period between heartbeat touches of a held lock.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Heartbeat age after which a lock is presumed abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

const LOG_TARGET: &str = "mysql_memory::cache";

/// Bounds how long a contender polls a lock held by a peer.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Number of polls before giving up.
    pub retries: u32,
    /// Pause between polls.
    pub retry_wait: Duration,
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock is now held by the caller.
    Acquired(DirLock),
    /// A live peer holds the lock.
    Held,
}

/// Guard for a held directory lock.
///
/// Dropping the guard stops the heartbeat and removes the lock directory;
/// call [`DirLock::release`] to observe removal failures.
#[derive(Debug)]
pub struct DirLock {
    lock_dir: Utf8PathBuf,
    heartbeat: Option<JoinHandle<()>>,
}

/// Returns the lock directory guarding `target`.
#[must_use]
pub fn lock_path_for(target: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{target}.lock"))
}

impl DirLock {
    /// Makes one attempt to take the lock guarding `target`, reclaiming it
    /// first when its holder has stopped heartbeating.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock directory cannot be created or
    /// inspected for reasons other than contention.
    pub async fn try_acquire(target: &Utf8Path) -> ServerResult<LockAttempt> {
        let lock_dir = lock_path_for(target);
        if let Some(parent) = lock_dir.parent() {
            ensure_dir_exists(parent)?;
        }

        // Extra passes cover the holder vanishing, or a stale lock being
        // reclaimed, between our failed create and the age check.
        for _ in 0..3 {
            if create_lock_dir(&lock_dir).await? {
                return Ok(LockAttempt::Acquired(Self::hold(lock_dir)));
            }

            match heartbeat_age(&lock_dir).map_err(|err| lock_io_error(&lock_dir, &err))? {
                None => {}
                Some(age) if age > STALE_AFTER => reclaim(&lock_dir)?,
                Some(_) => return Ok(LockAttempt::Held),
            }
        }
        // A reclaim on the last pass still deserves its create attempt.
        if create_lock_dir(&lock_dir).await? {
            return Ok(LockAttempt::Acquired(Self::hold(lock_dir)));
        }
        Ok(LockAttempt::Held)
    }

    /// Polls until the lock guarding `target` is held by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ServerErrorKind::LockTimeout`] once `policy.retries` polls
    /// have found the lock held by a live peer.
    pub async fn acquire(target: &Utf8Path, policy: LockPolicy) -> ServerResult<Self> {
        for _ in 0..=policy.retries {
            if let LockAttempt::Acquired(lock) = Self::try_acquire(target).await? {
                return Ok(lock);
            }
            tokio::time::sleep(policy.retry_wait).await;
        }
        Err(lock_timeout(target, policy))
    }

    /// Waits until no live peer holds the lock guarding `target`.
    ///
    /// A stale lock counts as released; the next acquisition reclaims it.
    ///
    /// # Errors
    ///
    /// Returns [`ServerErrorKind::LockTimeout`] once `policy.retries` polls
    /// have found the lock still held.
    pub async fn wait_until_released(target: &Utf8Path, policy: LockPolicy) -> ServerResult<()> {
        let lock_dir = lock_path_for(target);
        for _ in 0..=policy.retries {
            match heartbeat_age(&lock_dir).map_err(|err| lock_io_error(&lock_dir, &err))? {
                None => return Ok(()),
                Some(age) if age > STALE_AFTER => return Ok(()),
                Some(_) => tokio::time::sleep(policy.retry_wait).await,
            }
        }
        Err(lock_timeout(target, policy))
    }

    /// Stops the heartbeat and removes the lock directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock directory cannot be removed.
    pub fn release(mut self) -> ServerResult<()> {
        self.release_inner()
            .map_err(|err| lock_io_error(&self.lock_dir, &err))
    }

    fn hold(lock_dir: Utf8PathBuf) -> Self {
        debug!(target: LOG_TARGET, lock = %lock_dir, "acquired cache lock");
        let heartbeat = tokio::spawn(run_heartbeat(lock_dir.clone()));
        Self {
            lock_dir,
            heartbeat: Some(heartbeat),
        }
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(heartbeat) = self.heartbeat.take() else {
            return Ok(());
        };
        heartbeat.abort();
        remove_if_present(&self.lock_dir)?;
        debug!(target: LOG_TARGET, lock = %self.lock_dir, "released cache lock");
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(
                target: LOG_TARGET,
                lock = %self.lock_dir,
                error = %err,
                "failed to release cache lock; peers will reclaim it once stale"
            );
        }
    }
}

async fn run_heartbeat(lock_dir: Utf8PathBuf) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = filetime::set_file_mtime(&lock_dir, FileTime::now()) {
            warn!(
                target: LOG_TARGET,
                lock = %lock_dir,
                error = %err,
                "failed to refresh cache lock heartbeat"
            );
            return;
        }
    }
}

/// Creates the lock directory, returning `false` when it already exists.
async fn create_lock_dir(lock_dir: &Utf8Path) -> ServerResult<bool> {
    match tokio::fs::create_dir(lock_dir).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(lock_io_error(lock_dir, &err)),
    }
}

/// Returns how long ago the lock was last touched, or `None` when it is gone.
fn heartbeat_age(lock_dir: &Utf8Path) -> io::Result<Option<Duration>> {
    let modified = match std::fs::metadata(lock_dir).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    // A heartbeat from the future (clock skew between hosts) counts as fresh.
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(Some(age))
}

fn reclaim_guard_for(lock_dir: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{lock_dir}.reclaim"))
}

/// Removes `lock_dir` if it is still stale once the reclaim guard is held.
///
/// Returns without removing anything when another contender holds the
/// guard; the caller simply retries its acquisition.
fn reclaim(lock_dir: &Utf8Path) -> ServerResult<()> {
    let guard = reclaim_guard_for(lock_dir);
    match std::fs::create_dir(&guard) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            clear_abandoned_guard(&guard)?;
            return Ok(());
        }
        Err(err) => return Err(lock_io_error(&guard, &err)),
    }

    let result = remove_if_stale(lock_dir);
    if let Err(err) = remove_if_present(&guard) {
        warn!(
            target: LOG_TARGET,
            guard = %guard,
            error = %err,
            "failed to remove cache lock reclaim guard"
        );
    }
    result
}

fn remove_if_stale(lock_dir: &Utf8Path) -> ServerResult<()> {
    let observed = heartbeat_age(lock_dir).map_err(|err| lock_io_error(lock_dir, &err))?;
    let Some(age) = observed.filter(|elapsed| *elapsed > STALE_AFTER) else {
        debug!(target: LOG_TARGET, lock = %lock_dir, "cache lock no longer stale");
        return Ok(());
    };
    warn!(
        target: LOG_TARGET,
        lock = %lock_dir,
        age_secs = age.as_secs(),
        "reclaiming abandoned cache lock"
    );
    remove_if_present(lock_dir).map_err(|err| lock_io_error(lock_dir, &err))
}

/// Clears a reclaim guard left behind by a contender that died mid-reclaim.
fn clear_abandoned_guard(guard: &Utf8Path) -> ServerResult<()> {
    let age = heartbeat_age(guard).map_err(|err| lock_io_error(guard, &err))?;
    if age.is_some_and(|elapsed| elapsed > STALE_AFTER) {
        warn!(target: LOG_TARGET, guard = %guard, "clearing abandoned reclaim guard");
        remove_if_present(guard).map_err(|err| lock_io_error(guard, &err))?;
    }
    Ok(())
}

fn remove_if_present(dir: &Utf8Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn lock_timeout(target: &Utf8Path, policy: LockPolicy) -> ServerError {
    let lock_dir = lock_path_for(target);
    ServerError::new(
        ServerErrorKind::LockTimeout,
        eyre!(
            "timed out waiting for the cache lock at {lock_dir} after {} checks {}ms apart; \
             another process is still preparing {target}. Raise the lock retry budget, or \
             remove the lock directory if no other test run is active",
            policy.retries,
            policy.retry_wait.as_millis(),
        ),
    )
}

fn lock_io_error(lock_dir: &Utf8Path, err: &io::Error) -> ServerError {
    ServerError::from(eyre!("failed to manage cache lock {lock_dir}: {err}"))
}

//! Shared binary cache for downloaded MySQL distributions.
//!
//! Each resolved version is extracted once to `<cache>/<version>/mysql` and
//! reused by every later acquisition, including acquisitions from unrelated
//! processes sharing the same cache directory.
//!
//! # Cache Location
//!
//! The cache directory is resolved in the following order:
//!
//! 1. `MYSQL_BINARY_CACHE_DIR` environment variable if set
//! 2. `$XDG_CACHE_HOME/mysql-memory-server/binaries` if `XDG_CACHE_HOME` is set
//! 3. `~/.cache/mysql-memory-server/binaries`
//! 4. the system temporary directory
//!
//! # Cross-Process Coordination
//!
//! Writers serialise on a `<version>.lock` directory kept alive by a
//! heartbeat (see [`DirLock`]). Locks are per-version, so different versions
//! download concurrently.

mod config;
mod lock;
mod lookup;

pub use config::{CACHE_DIR_ENV, resolve_cache_dir};
pub use lock::{DirLock, HEARTBEAT_INTERVAL, LockAttempt, LockPolicy, STALE_AFTER, lock_path_for};
pub use lookup::{CacheLookupResult, SERVER_DIR, check_cache, executable_path, version_root};

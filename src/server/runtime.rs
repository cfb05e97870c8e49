//! Helpers for constructing the runtime owned by [`MysqlServer`](super::MysqlServer).

use color_eyre::eyre::Context;
use tokio::runtime::{Builder, Runtime};

use crate::error::{ServerError, ServerResult};

/// Constructs a current-thread Tokio runtime for blocking lifecycle calls.
///
/// # Errors
///
/// Returns an error when the runtime cannot be built, for example due to
/// resource limits.
pub(crate) fn build_runtime() -> ServerResult<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime for MysqlServer")
        .map_err(ServerError::from)
}

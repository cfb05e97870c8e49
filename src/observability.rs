//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log target used by server lifecycle events so subscribers
//! can filter them without pulling in unrelated application logs.

/// Target used by lifecycle spans and logs.
pub(crate) const LOG_TARGET: &str = "mysql_memory::observability";

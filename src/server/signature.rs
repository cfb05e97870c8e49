//! Recognises the server's state changes in its error log.
//!
//! The server reports everything interesting through `--log-error`; these
//! markers have been stable across the 8.x and 9.x series.

/// State change announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The primary port (or its socket) is already bound.
    PortInUse,
    /// The X protocol port is already bound.
    AuxPortInUse,
    /// The server accepts connections.
    Ready,
}

const AUX_MARKER: &str = "Mysqlx";
const ADDRESS_IN_USE: &str = "Address already in use";
const PRIMARY_CONFLICT: &str = "Do you already have another mysqld server running on port";
const PRIMARY_BIND_FAILURE: &str = "Bind on TCP/IP port: Address already in use";
const READY: &str = "ready for connections. Version";

/// Classifies a chunk of newly appended log text.
///
/// Conflicts outrank readiness: the server can report itself ready while
/// the X plugin failed to bind, and that launch must still be retried.
///
/// # Examples
///
/// ```
/// use mysql_memory_server::server::{Signal, detect_signature};
///
/// let line = "[System] [MY-010931] [Server] /opt/mysqld: ready for connections. \
///             Version: '8.0.34'  socket: '/tmp/mysql.sock'  port: 3306";
/// assert_eq!(detect_signature(line), Some(Signal::Ready));
/// assert_eq!(detect_signature("[Note] InnoDB: Buffer pool(s) load completed"), None);
/// ```
#[must_use]
pub fn detect_signature(chunk: &str) -> Option<Signal> {
    let lines = || chunk.lines();
    if lines().any(|line| line.contains(AUX_MARKER) && line.contains(ADDRESS_IN_USE)) {
        return Some(Signal::AuxPortInUse);
    }
    if lines().any(|line| line.contains(PRIMARY_CONFLICT) || line.contains(PRIMARY_BIND_FAILURE)) {
        return Some(Signal::PortInUse);
    }
    lines()
        .any(|line| line.contains(READY))
        .then_some(Signal::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bind(
        "2024-01-01T00:00:00Z 0 [ERROR] [MY-010262] [Server] Can't start server: \
         Bind on TCP/IP port: Address already in use",
        Some(Signal::PortInUse)
    )]
    #[case::another_server(
        "[ERROR] [MY-010257] [Server] Do you already have another mysqld server running on port: 3306 ?",
        Some(Signal::PortInUse)
    )]
    #[case::x_plugin(
        "[ERROR] [MY-011300] [Server] Plugin mysqlx reported: 'Setup of bind-address: '*' port: \
         33060 failed, `bind()` failed: Address already in use (98). Do you already have another \
         mysqld server running with Mysqlx ?'",
        Some(Signal::AuxPortInUse)
    )]
    #[case::x_ready(
        "[System] [MY-011323] [Server] X Plugin ready for connections. Bind-address: '::' port: 33060",
        None
    )]
    #[case::empty("", None)]
    fn classifies_lines(#[case] chunk: &str, #[case] expected: Option<Signal>) {
        assert_eq!(detect_signature(chunk), expected);
    }

    #[test]
    fn aux_conflict_outranks_readiness_in_one_chunk() {
        let chunk = "\
[System] [MY-010931] [Server] mysqld: ready for connections. Version: '8.0.34'
[ERROR] [MY-011300] [Server] Plugin mysqlx reported: 'bind() failed: Address already in use (98). Do you already have another mysqld server running with Mysqlx ?'
";
        assert_eq!(detect_signature(chunk), Some(Signal::AuxPortInUse));
    }
}

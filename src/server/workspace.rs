//! Per-instance directory layout.

use std::io::ErrorKind as IoErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};

use crate::cleanup_helpers::try_remove_dir_all;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::fs::create_private_dir;
use crate::options::ServerOptions;

/// Length of the random instance identifier; short because Unix socket
/// paths are limited to roughly 100 bytes.
const INSTANCE_ID_LEN: usize = 12;

/// Files and directories owned by one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstanceWorkspace {
    pub(crate) root: Utf8PathBuf,
    pub(crate) data_dir: Utf8PathBuf,
    pub(crate) stdout_log: Utf8PathBuf,
    pub(crate) stderr_log: Utf8PathBuf,
    pub(crate) bootstrap_stdout: Utf8PathBuf,
    pub(crate) bootstrap_stderr: Utf8PathBuf,
    pub(crate) error_log: Utf8PathBuf,
    pub(crate) init_file: Utf8PathBuf,
    pub(crate) socket: Utf8PathBuf,
    pub(crate) x_socket: Utf8PathBuf,
}

impl InstanceWorkspace {
    /// Creates a fresh, owner-only directory below `data_root`.
    pub(crate) fn create(data_root: &Utf8Path) -> ServerResult<Self> {
        let id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(INSTANCE_ID_LEN)
            .collect();
        let workspace = Self::at(data_root.join(id));
        create_private_dir(&workspace.root)
            .with_context(|| format!("create instance workspace {}", workspace.root))?;
        Ok(workspace)
    }

    fn at(root: Utf8PathBuf) -> Self {
        Self {
            data_dir: root.join("data"),
            stdout_log: root.join("log.log"),
            stderr_log: root.join("stderr.log"),
            bootstrap_stdout: root.join("bootstrap.log"),
            bootstrap_stderr: root.join("bootstrap-stderr.log"),
            error_log: root.join("errorlog.err"),
            init_file: root.join("init.sql"),
            socket: root.join("mysql.sock"),
            x_socket: root.join("mysqlx.sock"),
            root,
        }
    }

    /// Writes the script the server runs on every start.
    pub(crate) fn write_init_script(&self, options: &ServerOptions) -> ServerResult<()> {
        let script = init_script(&options.db_name, &options.username, &options.init_sql);
        std::fs::write(&self.init_file, script)
            .with_context(|| format!("write {}", self.init_file))?;
        Ok(())
    }

    /// Empties the error log so the next spawn is judged on its own output.
    pub(crate) fn reset_logs(&self) -> ServerResult<()> {
        for log in [&self.error_log, &self.stderr_log] {
            match std::fs::remove_file(log) {
                Ok(()) => {}
                Err(err) if err.kind() == IoErrorKind::NotFound => {}
                Err(err) => return Err(eyre!("clear {log}: {err}").into()),
            }
        }
        Ok(())
    }

    /// Deletes the data directory ahead of a re-bootstrap.
    ///
    /// # Errors
    ///
    /// Failure is fatal ([`ErrorKind::Cleanup`]): bootstrapping over a
    /// half-deleted directory would fail less clearly later.
    pub(crate) fn reset_data_dir(&self) -> ServerResult<()> {
        try_remove_dir_all(self.data_dir.as_std_path()).map_err(|err| {
            ServerError::new(
                ErrorKind::Cleanup,
                eyre!(
                    "failed to delete {} before retrying on new ports: {err}",
                    self.data_dir
                ),
            )
        })?;
        Ok(())
    }

    /// Reads the error log, returning an empty string when it is absent.
    pub(crate) fn read_error_log(&self) -> String {
        read_lossy(&self.error_log)
    }

    /// Reads the server's captured stderr.
    pub(crate) fn read_stderr(&self) -> String {
        read_lossy(&self.stderr_log)
    }
}

fn read_lossy(path: &Utf8Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Builds the initialisation script: database, account, then caller SQL.
pub(crate) fn init_script(db_name: &str, username: &str, extra_sql: &str) -> String {
    let mut script = format!(
        "CREATE DATABASE IF NOT EXISTS {};\n",
        quote_identifier(db_name)
    );
    if username != "root" {
        let account = format!("{}@'%'", quote_string(username));
        script.push_str(&format!(
            "CREATE USER IF NOT EXISTS {account};\nGRANT ALL ON *.* TO {account};\n"
        ));
    }
    if !extra_sql.trim().is_empty() {
        script.push_str(extra_sql.trim_end());
        script.push('\n');
    }
    script
}

fn quote_identifier(raw: &str) -> String {
    format!("`{}`", raw.replace('`', "``"))
}

fn quote_string(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_lays_out_short_private_root() {
        let temp = tempdir().expect("tempdir");
        let data_root = Utf8Path::from_path(temp.path()).expect("utf8 path");

        let workspace = InstanceWorkspace::create(data_root).expect("create");

        assert!(workspace.root.is_dir());
        assert_eq!(
            workspace.root.file_name().map(str::len),
            Some(INSTANCE_ID_LEN)
        );
        assert_eq!(workspace.error_log, workspace.root.join("errorlog.err"));
        assert!(!workspace.data_dir.exists(), "bootstrap creates the data directory");
    }

    #[test]
    fn two_workspaces_never_collide() {
        let temp = tempdir().expect("tempdir");
        let data_root = Utf8Path::from_path(temp.path()).expect("utf8 path");

        let first = InstanceWorkspace::create(data_root).expect("first");
        let second = InstanceWorkspace::create(data_root).expect("second");

        assert_ne!(first.root, second.root);
    }

    #[test]
    fn root_user_gets_database_only() {
        let script = init_script("dbdata", "root", "");
        assert_eq!(script, "CREATE DATABASE IF NOT EXISTS `dbdata`;\n");
    }

    #[test]
    fn other_users_are_created_and_granted() {
        let script = init_script("shop", "o'brien", "CREATE TABLE shop.t (id INT);");
        assert_eq!(
            script,
            "CREATE DATABASE IF NOT EXISTS `shop`;\n\
             CREATE USER IF NOT EXISTS 'o''brien'@'%';\n\
             GRANT ALL ON *.* TO 'o''brien'@'%';\n\
             CREATE TABLE shop.t (id INT);\n"
        );
    }

    #[test]
    fn identifiers_escape_backticks() {
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn reset_data_dir_removes_tree_and_tolerates_absence() {
        let temp = tempdir().expect("tempdir");
        let data_root = Utf8Path::from_path(temp.path()).expect("utf8 path");
        let workspace = InstanceWorkspace::create(data_root).expect("create");
        std::fs::create_dir_all(workspace.data_dir.join("mysql")).expect("data dir");

        workspace.reset_data_dir().expect("reset");
        workspace.reset_data_dir().expect("second reset is a no-op");

        assert!(!workspace.data_dir.exists());
    }
}

//! Starts a disposable MySQL server configured through `MYSQL_*`
//! environment variables, logs how to connect, and keeps it running until
//! Ctrl-C. The instance's files are removed on exit.
//!
//! The binary exits with status code `0` after a clean shutdown and `1`
//! when the server could not be started.

use color_eyre::eyre::{Context, Result};
use mysql_memory_server::{ErrorKind, MysqlEnvCfg, create_db};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::level_filters::LevelFilter;

const LOG_TARGET: &str = "mysql_memory::cli";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cfg = MysqlEnvCfg::load().context("failed to load configuration via OrthoConfig")?;
    let options = cfg.to_options()?;
    tracing_subscriber::fmt()
        .with_max_level(options.log_level.max(LevelFilter::INFO))
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let launch = create_db(options, cancel.clone());
    tokio::pin!(launch);
    let handle = tokio::select! {
        result = &mut launch => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            cancel.cancel();
            // Let the launch observe cancellation and remove what it created.
            return match launch.await {
                Ok(handle) => {
                    handle.stop().await;
                    Ok(())
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => Ok(()),
                Err(err) => Err(err.into()),
            };
        }
    };

    info!(
        target: LOG_TARGET,
        url = %handle.connection_url(),
        socket = %handle.socket(),
        x_port = ?handle.x_port(),
        version = %handle.version(),
        "mysql server ready; press Ctrl-C to stop"
    );
    let waited = tokio::signal::ctrl_c().await;
    handle.stop().await;
    waited.context("failed to listen for Ctrl-C")
}

//! `taskify serve`: run the server.

use std::path::{Path, PathBuf};

use anyhow::Result;
use taskify::config::TaskifyConfig;

pub async fn cmd_serve(
    config_path: Option<&Path>,
    verbose: bool,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut config = TaskifyConfig::resolve(config_path)?.with_cli_args(port, db_path, dev);
    config.validate()?;

    // Flushes the file log on drop.
    let _guard = taskify::telemetry::init(&config.logging, verbose)?;

    taskify::app::server::start_server(config).await
}

//! `taskify init-db`: create or migrate the database.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use taskify::app::db::TaskifyDb;
use taskify::config::TaskifyConfig;

pub fn cmd_init_db(config_path: Option<&Path>, db_path: Option<PathBuf>) -> Result<()> {
    let config = TaskifyConfig::resolve(config_path)?.with_cli_args(None, db_path, false);
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    TaskifyDb::new(path)?.close()?;
    println!("Database initialized at {}", path.display());
    Ok(())
}

//! `taskify config`: print the effective configuration.

use std::path::Path;

use anyhow::Result;
use taskify::config::TaskifyConfig;

pub fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = TaskifyConfig::resolve(config_path)?;
    match config_path {
        Some(path) => println!("# Config file: {}", path.display()),
        None => println!("# Defaults, taskify.toml (if present) and environment"),
    }
    print!("{}", config.redacted_toml()?);
    Ok(())
}

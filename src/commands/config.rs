use anyhow::Result;
use std::path::Path;

use adsb_bridge::config::BridgeConfig;

/// Print the effective configuration with secrets masked
pub fn handle_config(config: &BridgeConfig, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file found; built-in defaults"),
    }
    print!("{}", config.redacted().to_toml()?);
    Ok(())
}

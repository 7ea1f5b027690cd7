// Configuration loader
// Loads settings from ~/.modelkit/config.toml, falling back to defaults

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::Config;

/// Location of the user configuration file
pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".modelkit/config.toml"))
}

/// Load configuration from the user config file, or defaults if it is absent
pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config_from(&path)
}

/// Load and validate configuration from `path`
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if config.batch_capacity == 0 {
        bail!(
            "batch_capacity in {} must be at least 1",
            path.display()
        );
    }

    Ok(config)
}

//! Configuration file parsing for hubscript.toml.

use hubscript_runtime::RuntimeConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Run as a long-lived server unless overridden on the command line
    #[serde(default)]
    pub daemon: bool,

    /// Runtime tuning: queue sizes, timeouts, tracker and network settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Load configuration from a file or search for default config files.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    // An explicit path must exist; a missing default file just means defaults
    if let Some(path) = path {
        if !path.exists() {
            anyhow::bail!("Config file {} not found", path.display());
        }
    }
    let config_path = path.map(PathBuf::from).or_else(find_config_file);

    match config_path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "Loaded config");
            Ok(config)
        }
        _ => Ok(Config::default()),
    }
}

/// Search for configuration file in the current directory and parent directories.
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;

    const CONFIG_NAMES: &[&str] = &["hubscript.toml", ".hubscriptrc.toml"];

    let mut dir = Some(cwd.as_path());
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }

    None
}

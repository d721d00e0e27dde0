// Configuration management for the roampool CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/roampool/config.json
// - Linux: ~/.config/roampool/config.json
// - Windows: %APPDATA%\roampool\config.json
//
// The file holds a `RoamingConfig` as JSON; missing fields take defaults.

use anyhow::{Context, Result};
use roampool_core::RoamingConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("roampool");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

/// Get the data directory path (cross-platform)
pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Failed to determine data directory")?
        .join("roampool");

    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    Ok(data_dir)
}

/// Default config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load config from `path` (or the default location), creating a default
/// file at the default location if none exists yet.
pub fn load(path: Option<&Path>) -> Result<RoamingConfig> {
    let (file, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (config_file()?, false),
    };

    let mut config = if file.exists() {
        let contents = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read config file {}", file.display()))?;
        serde_json::from_str::<RoamingConfig>(&contents)
            .with_context(|| format!("Failed to parse config file {}", file.display()))?
    } else if explicit {
        anyhow::bail!("Config file {} does not exist", file.display());
    } else {
        let config = RoamingConfig::default();
        save(&config, &file)?;
        config
    };

    if config.bonding_db_path.is_relative() {
        config.bonding_db_path = data_dir()?.join(&config.bonding_db_path);
    }
    Ok(config)
}

/// Save config to `path`
pub fn save(config: &RoamingConfig, path: &Path) -> Result<()> {
    let contents = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

/// Set one field by name, parsing `value` the way it appears in the file
pub fn set(config: &mut RoamingConfig, key: &str, value: &str) -> Result<()> {
    let mut json = serde_json::to_value(&*config).context("Failed to serialize config")?;
    let fields = json
        .as_object_mut()
        .context("Config is not a JSON object")?;
    if !fields.contains_key(key) {
        anyhow::bail!("Unknown config key: {}", key);
    }
    // Bare words that aren't valid JSON are taken as strings
    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);

    let updated: RoamingConfig = serde_json::from_value(json)
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
    updated.validate()?;
    *config = updated;
    Ok(())
}

/// List all config values
pub fn list(config: &RoamingConfig) -> Result<Vec<(String, String)>> {
    let json = serde_json::to_value(config).context("Failed to serialize config")?;
    let fields = json.as_object().context("Config is not a JSON object")?;
    Ok(fields
        .iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect())
}

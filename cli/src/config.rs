// Configuration management for the gattlink CLI
//
// Settings live in the platform config directory:
// - macOS: ~/Library/Application Support/gattlink/config.json
// - Linux: ~/.config/gattlink/config.json
// - Windows: %APPDATA%\gattlink\config.json

use anyhow::{Context, Result};
use gattlink_core::Settings;
use std::path::{Path, PathBuf};

/// Get the config directory path, creating it if needed
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("gattlink");
    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    Ok(config_dir)
}

pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load settings from `path`, falling back to defaults when it does not exist
pub fn load_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    Settings::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn save_to(settings: &Settings, path: &Path) -> Result<()> {
    settings
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Every settable key with its current value
pub fn list(settings: &Settings) -> Vec<(&'static str, String)> {
    let gatt = &settings.gatt;
    vec![
        (
            "connect_internal_timeout_ms",
            gatt.connect_internal_timeout_ms.to_string(),
        ),
        (
            "connect_external_timeout_ms",
            gatt.connect_external_timeout_ms.to_string(),
        ),
        ("operation_timeout_ms", gatt.operation_timeout_ms.to_string()),
        ("disconnect_timeout_ms", gatt.disconnect_timeout_ms.to_string()),
        (
            "discovery_delay_bonded_ms",
            gatt.discovery_delay_bonded_ms.to_string(),
        ),
        (
            "discovery_delay_unbonded_ms",
            gatt.discovery_delay_unbonded_ms.to_string(),
        ),
        ("default_ttl_ms", settings.registry.default_ttl_ms.to_string()),
    ]
}

pub fn get(settings: &Settings, key: &str) -> Option<String> {
    list(settings)
        .into_iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
}

/// Set a single value; the result is validated before it is accepted
pub fn set(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    let ms: u64 = value
        .parse()
        .with_context(|| format!("Invalid number of milliseconds: {}", value))?;
    let mut updated = settings.clone();
    let gatt = &mut updated.gatt;
    match key {
        "connect_internal_timeout_ms" => gatt.connect_internal_timeout_ms = ms,
        "connect_external_timeout_ms" => gatt.connect_external_timeout_ms = ms,
        "operation_timeout_ms" => gatt.operation_timeout_ms = ms,
        "disconnect_timeout_ms" => gatt.disconnect_timeout_ms = ms,
        "discovery_delay_bonded_ms" => gatt.discovery_delay_bonded_ms = ms,
        "discovery_delay_unbonded_ms" => gatt.discovery_delay_unbonded_ms = ms,
        "default_ttl_ms" => updated.registry.default_ttl_ms = ms,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    updated.validate()?;
    *settings = updated;
    Ok(())
}

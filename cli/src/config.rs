// Configuration management for the ucomms CLI
//
// The node configuration is the core `CommsConfig`, stored as JSON in:
// - macOS: ~/Library/Application Support/ucomms/config.json
// - Linux: ~/.config/ucomms/config.json
// - Windows: %APPDATA%\ucomms\config.json

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use unified_comms_core::config::IV_TAIL_LEN;
use unified_comms_core::{Address, CommsConfig};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("ucomms");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

/// Resolve the config file, honouring an explicit `--config` path
pub fn config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("config.json")),
    }
}

/// Load the config, falling back to defaults when no file exists yet
pub fn load(explicit: Option<&Path>) -> Result<CommsConfig> {
    let path = config_file(explicit)?;
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(CommsConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    CommsConfig::from_json(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn save(config: &CommsConfig, explicit: Option<&Path>) -> Result<PathBuf> {
    let path = config_file(explicit)?;
    config.validate().context("Refusing to save an invalid config")?;
    let contents = config.to_json_pretty().context("Failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(path)
}

/// Set a config value by its dotted key
pub fn set(config: &mut CommsConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "local_address" => {
            config.local_address = value.parse::<Address>().context("Invalid address")?;
        }
        "bluetooth.iv_tail" => {
            let bytes = hex::decode(value).context("Invalid hex")?;
            config.bluetooth.iv_tail = bytes
                .try_into()
                .map_err(|b: Vec<u8>| anyhow::anyhow!("iv_tail must be {} bytes, got {}", IV_TAIL_LEN, b.len()))?;
        }
        "bluetooth.advertise_connectable" => {
            config.bluetooth.advertise_connectable = value.parse().context("Invalid boolean value")?;
        }
        "bluetooth.multi_packet_timeout_ms" => {
            config.bluetooth.multi_packet_timeout_ms = value.parse().context("Invalid number")?;
        }
        "bluetooth.phone_advertise_count" => {
            config.bluetooth.phone_advertise_count = value.parse().context("Invalid number")?;
        }
        "bluetooth.default_advertise_count" => {
            config.bluetooth.default_advertise_count = value.parse().context("Invalid number")?;
        }
        "serial.max_frame_len" => {
            config.serial.max_frame_len = value.parse().context("Invalid number")?;
        }
        "gatt.mtu" => {
            config.gatt.mtu = value.parse().context("Invalid number")?;
        }
        "gatt.send_timeout_ms" => {
            config.gatt.send_timeout_ms = value.parse().context("Invalid number")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    config.validate().with_context(|| format!("Invalid value for {}", key))?;
    Ok(())
}

/// List all config values
pub fn list(config: &CommsConfig) -> Vec<(String, String)> {
    vec![
        ("local_address".to_string(), config.local_address.to_string()),
        ("bluetooth.iv_tail".to_string(), hex::encode(config.bluetooth.iv_tail)),
        (
            "bluetooth.advertise_connectable".to_string(),
            config.bluetooth.advertise_connectable.to_string(),
        ),
        (
            "bluetooth.multi_packet_timeout_ms".to_string(),
            config.bluetooth.multi_packet_timeout_ms.to_string(),
        ),
        (
            "bluetooth.phone_advertise_count".to_string(),
            config.bluetooth.phone_advertise_count.to_string(),
        ),
        (
            "bluetooth.default_advertise_count".to_string(),
            config.bluetooth.default_advertise_count.to_string(),
        ),
        ("serial.max_frame_len".to_string(), config.serial.max_frame_len.to_string()),
        ("gatt.mtu".to_string(), config.gatt.mtu.to_string()),
        ("gatt.send_timeout_ms".to_string(), config.gatt.send_timeout_ms.to_string()),
    ]
}

pub fn get(config: &CommsConfig, key: &str) -> Option<String> {
    list(config).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

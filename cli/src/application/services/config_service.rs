//! Application service: configuration use-cases.

use anyhow::Result;

use crate::application::ports::ConfigStore;
use crate::domain::config::AfpackConfig;

/// Load configuration.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config(store: &impl ConfigStore) -> Result<AfpackConfig> {
    store.load()
}

/// Validate and persist one `key = value` setting; returns the updated config.
///
/// # Errors
///
/// Returns an error for unknown keys, invalid values, or when the file
/// cannot be read or written. Nothing is written on a validation error.
pub fn set_value(store: &impl ConfigStore, key: &str, value: &str) -> Result<AfpackConfig> {
    let mut config = store.load()?;
    config.apply(key, value)?;
    config.sizing()?;
    store.save(&config)?;
    Ok(config)
}

/// Current value of one setting, as shown by `afpack config show`.
///
/// # Errors
///
/// Returns an error for unknown keys.
pub fn get_value(store: &impl ConfigStore, key: &str) -> Result<String> {
    crate::domain::config::validate_config_key(key)?;
    let config = store.load()?;
    config
        .entries()
        .into_iter()
        .find_map(|(k, v)| (k == key).then_some(v))
        .ok_or_else(|| anyhow::anyhow!("Unknown setting: {key}"))
}

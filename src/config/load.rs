use super::{ConfigError, Settings};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "ALLMA_CONFIG";

pub fn resolve_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Loads settings from `path` (or `ALLMA_CONFIG`), falls back to defaults when
/// neither is given, then applies environment overrides and validates.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = match resolve_settings_path(path) {
        Some(path) => Settings::from_path(&path)?,
        None => Settings::default(),
    };
    settings.apply_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}

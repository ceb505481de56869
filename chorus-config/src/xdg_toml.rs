//! Load `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn xdg_config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    let base = cross_xdg::BaseDirs::new().map_err(|e| LoadError::XdgPath(e.to_string()))?;
    let config_dir = base.config_home();
    let path = config_dir.join(app_name).join("config.toml");
    if path.exists() {
        Ok(Some(path))
    } else {
        Ok(None)
    }
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    scheduler: Option<crate::SchedulerConfigFile>,
}

/// Returns env key-value pairs from `[env]` section. Missing file or empty section returns empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    Ok(load_config_file(app_name)?
        .map(|c| c.env)
        .unwrap_or_default())
}

/// Returns the `[scheduler]` table, if present.
pub fn load_scheduler_overrides(
    app_name: &str,
) -> Result<Option<crate::SchedulerConfigFile>, LoadError> {
    Ok(load_config_file(app_name)?.and_then(|c| c.scheduler))
}

fn load_config_file(app_name: &str) -> Result<Option<ConfigFile>, LoadError> {
    let path = match xdg_config_path(app_name)? {
        Some(p) => p,
        None => return Ok(None),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(Some(config))
}

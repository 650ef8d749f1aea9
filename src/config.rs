use crate::types::*;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

pub const APP_NAME: &str = "cmus-installer";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "CMUS_INSTALLER_CONFIG";

pub fn get_config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_NAME)
        .join(CONFIG_FILE_NAME);
    tracing::debug!("Config file path: {}", path.display());
    Ok(path)
}

pub fn load_config() -> Result<InstallerConfig> {
    let config_path = get_config_file_path()?;

    let config = if config_path.exists() {
        let content = fs::read_to_string(&config_path).with_context(|| {
            format!("Could not read config file at {}", config_path.display())
        })?;
        serde_json::from_str(&content).with_context(|| "Could not parse config file as JSON")?
    } else {
        InstallerConfig::default()
    };

    Ok(config)
}

/// Layer `CMUS_INSTALLER_*` variables over `settings` for a single run.
///
/// Never applied before saving, so overrides stay out of the config file.
pub fn apply_env_overrides(settings: &mut InstallerSettings) {
    if let Ok(url) = std::env::var("CMUS_INSTALLER_DOWNLOAD_URL") {
        settings.download_url = url;
    }

    if let Ok(dir) = std::env::var("CMUS_INSTALLER_STAGING_DIR") {
        settings.staging_dir = Some(dir);
    }

    if let Ok(method) = std::env::var("CMUS_INSTALLER_INSTALL_METHOD") {
        match InstallMethod::parse(&method) {
            Some(method) => settings.install_method = method,
            None => tracing::warn!("Ignoring unknown install method '{}'", method),
        }
    }

    if let Ok(make) = std::env::var("CMUS_INSTALLER_MAKE") {
        settings.make_program = make;
    }
}

pub fn save_config(config: &InstallerConfig) -> Result<()> {
    let config_path = get_config_file_path()?;
    let config_dir = config_path
        .parent()
        .ok_or_else(|| anyhow!("Invalid config path"))?;

    fs::create_dir_all(config_dir)?;

    let content = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, content)
        .with_context(|| format!("Could not write config file at {}", config_path.display()))?;

    Ok(())
}

pub const SETTING_KEYS: [&str; 6] = [
    "download_url",
    "user_agent",
    "staging_dir",
    "install_method",
    "make_program",
    "timeout_secs",
];

pub fn get_setting(settings: &InstallerSettings, key: &str) -> Option<String> {
    let value = match normalize_key(key).as_str() {
        "download_url" => settings.download_url.clone(),
        "user_agent" => settings.user_agent.clone(),
        "staging_dir" => settings.staging_dir.clone().unwrap_or_default(),
        "install_method" => settings.install_method.to_string(),
        "make_program" => settings.make_program.clone(),
        "timeout_secs" => settings.timeout_secs.to_string(),
        _ => return None,
    };
    Some(value)
}

pub fn set_setting(settings: &mut InstallerSettings, key: &str, value: &str) -> Result<()> {
    match normalize_key(key).as_str() {
        "download_url" => {
            if !value.contains("{tag}") && !value.contains("{version}") {
                return Err(anyhow!(
                    "download_url must contain a '{{tag}}' or '{{version}}' placeholder"
                ));
            }
            settings.download_url = value.to_string();
        }
        "user_agent" => settings.user_agent = value.to_string(),
        "staging_dir" => {
            settings.staging_dir = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        "install_method" => {
            settings.install_method = InstallMethod::parse(value)
                .ok_or_else(|| anyhow!("Invalid install method '{}'. Use 'build' or 'copy'", value))?;
        }
        "make_program" => settings.make_program = value.to_string(),
        "timeout_secs" => {
            settings.timeout_secs = value
                .parse::<u64>()
                .with_context(|| format!("Invalid value for 'timeout_secs': {}", value))?;
        }
        other => {
            return Err(anyhow!(
                "'{}' is not a valid configuration setting. Valid settings: {}",
                other,
                SETTING_KEYS.join(", ")
            ))
        }
    }
    Ok(())
}

pub fn unset_setting(settings: &mut InstallerSettings, key: &str) -> Result<()> {
    let defaults = InstallerSettings::default();
    let value = get_setting(&defaults, key).ok_or_else(|| {
        anyhow!(
            "'{}' is not a valid configuration setting. Valid settings: {}",
            key,
            SETTING_KEYS.join(", ")
        )
    })?;
    set_setting(settings, key, &value)
}

pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                format!("_{}", c.to_lowercase())
            } else {
                c.to_string()
            }
        })
        .collect::<String>()
        .to_lowercase()
}

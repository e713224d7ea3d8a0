use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_TEMP_DIR_NAME: &str = ".fileserver_temp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Defaults to `<root_dir>/.fileserver_temp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub reap_interval_secs: u64,
    pub upload_idle_secs: u64,
    pub package_ttl_secs: u64,
    pub downloaded_package_ttl_secs: u64,
    pub default_chunk_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            server: ServerSettings::default(),
            transfer: TransferSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            temp_dir: None,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            reap_interval_secs: 60,
            upload_idle_secs: 60,
            package_ttl_secs: 60,
            downloaded_package_ttl_secs: 24 * 60 * 60,
            default_chunk_bytes: 1024 * 1024,
        }
    }
}

impl ServerSettings {
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(DEFAULT_TEMP_DIR_NAME))
    }
}

/// `FILESERVER_CONFIG_DIR`, else `$HOME/.config/fileserver`.
pub fn config_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("FILESERVER_CONFIG_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".config").join("fileserver")
}

/// `FILESERVER_DATA_DIR`, else `$HOME/.local/share/fileserver`.
pub fn data_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("FILESERVER_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".local")
        .join("share")
        .join("fileserver")
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = to_toml(settings)?;
    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "unsupported settings schema version: {} (expected {SETTINGS_SCHEMA_VERSION})",
                settings.version
            ),
        });
    }

    let t = &settings.transfer;
    for (name, value) in [
        ("transfer.reap_interval_secs", t.reap_interval_secs),
        ("transfer.upload_idle_secs", t.upload_idle_secs),
        ("transfer.package_ttl_secs", t.package_ttl_secs),
        (
            "transfer.downloaded_package_ttl_secs",
            t.downloaded_package_ttl_secs,
        ),
        ("transfer.default_chunk_bytes", t.default_chunk_bytes),
    ] {
        if value == 0 {
            return Err(Error::InvalidConfig {
                message: format!("{name} must be > 0"),
            });
        }
    }

    if settings.server.root_dir.as_os_str().is_empty() {
        return Err(Error::InvalidConfig {
            message: "server.root_dir must not be empty".to_string(),
        });
    }
    if let Some(temp) = &settings.server.temp_dir
        && temp.as_os_str().is_empty()
    {
        return Err(Error::InvalidConfig {
            message: "server.temp_dir must not be empty".to_string(),
        });
    }
    if let Some(level) = &settings.logging.level
        && level.trim().is_empty()
    {
        return Err(Error::InvalidConfig {
            message: "logging.level must not be empty".to_string(),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

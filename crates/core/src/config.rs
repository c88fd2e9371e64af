use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

const MAX_SAMPLE_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Empty means `<data_dir>/Backups`.
    #[serde(default)]
    pub directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Empty means `<data_dir>/messages.sqlite`.
    #[serde(default)]
    pub db_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSettings {
    pub sample_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            backup: BackupSettings::default(),
            store: StoreSettings::default(),
            progress: ProgressSettings::default(),
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: crate::progress::DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn backup_dir(&self, data_dir: &Path) -> PathBuf {
        non_empty_path(&self.backup.directory).unwrap_or_else(|| data_dir.join("Backups"))
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        non_empty_path(&self.store.db_path).unwrap_or_else(|| data_dir.join("messages.sqlite"))
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress.sample_interval_ms)
    }
}

fn non_empty_path(s: &str) -> Option<PathBuf> {
    let s = s.trim();
    (!s.is_empty()).then(|| PathBuf::from(s))
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
    parse_settings(&text)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

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
    let interval = settings.progress.sample_interval_ms;
    if interval == 0 || interval > MAX_SAMPLE_INTERVAL_MS {
        return Err(Error::InvalidConfig {
            message: format!("progress.sample_interval_ms must be in 1..={MAX_SAMPLE_INTERVAL_MS}"),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let s = load_settings(temp.path()).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.backup_dir(Path::new("/data")), Path::new("/data/Backups"));
        assert_eq!(
            s.db_path(Path::new("/data")),
            Path::new("/data/messages.sqlite")
        );
        assert_eq!(s.sample_interval().as_millis(), 16);
    }

    #[test]
    fn sections_are_optional() {
        let s = parse_settings("version = 1\n[backup]\ndirectory = \"/tmp/b\"\n").unwrap();
        assert_eq!(s.backup_dir(Path::new("/data")), Path::new("/tmp/b"));
        assert_eq!(s.progress.sample_interval_ms, 16);
    }

    #[test]
    fn version_is_validated() {
        let err = parse_settings("version = 2\n").unwrap_err();
        assert!(err.to_string().contains("schema version"));
    }

    #[test]
    fn sample_interval_is_validated() {
        let err = parse_settings("version = 1\n[progress]\nsample_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("sample_interval_ms"));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let temp = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.store.db_path = "/var/db/m.sqlite".to_string();
        s.progress.sample_interval_ms = 100;

        save_settings(&temp.path().join("cfg"), &s).unwrap();
        assert_eq!(load_settings(&temp.path().join("cfg")).unwrap(), s);
    }
}

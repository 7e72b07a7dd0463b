// User configuration loaded from config.toml

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_ENV: &str = "BOOTSTICK_CONFIG";
const CONFIG_FILE: &str = "config.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "Bootstick", "Imager")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Device list polling period
    pub poll_interval_ms: u64,
    /// Partition start alignment in 512-byte sectors
    pub alignment_sectors: u64,
    pub write_chunk_bytes: usize,
    /// FAT32 allocation unit in bytes
    pub cluster_size: u32,
    pub volume_label: String,
    pub cache_dir: Option<PathBuf>,
    pub log_to_file: bool,
    pub telemetry: Option<TelemetrySettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            alignment_sectors: 2048,
            write_chunk_bytes: 4 * 1024 * 1024,
            cluster_size: 4096,
            volume_label: "BOOTSTICK".to_string(),
            cache_dir: None,
            log_to_file: true,
            telemetry: None,
        }
    }
}

impl Settings {
    /// Load from `$BOOTSTICK_CONFIG` or the default config location.
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Where downloaded images are kept
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("bootstick"))
    }

    pub fn log_dir(&self) -> PathBuf {
        project_dirs()
            .map(|dirs| {
                dirs.state_dir()
                    .unwrap_or_else(|| dirs.data_local_dir())
                    .join("logs")
            })
            .unwrap_or_else(|| std::env::temp_dir().join("bootstick").join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.poll_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
volume_label = "RESCUE"
cluster_size = 8192

[telemetry]
endpoint = "https://metrics.example.com/prod"
api_key = "secret"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.volume_label, "RESCUE");
        assert_eq!(settings.cluster_size, 8192);
        assert_eq!(settings.alignment_sectors, 2048);
        assert_eq!(settings.telemetry.unwrap().api_key, "secret");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_cache_dir_override() {
        let settings = Settings {
            cache_dir: Some(PathBuf::from("/srv/images")),
            ..Settings::default()
        };
        assert_eq!(settings.cache_dir(), PathBuf::from("/srv/images"));
    }
}

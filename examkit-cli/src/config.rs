//! CLI configuration handling.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use examkit_core::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Settings handed to the API client.
    #[serde(flatten)]
    pub client: ClientConfig,

    /// Directory holding the session file; the platform data directory when
    /// unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl CliConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".examkit"))
        })
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("examkit.toml"))
        .unwrap_or_else(|| PathBuf::from("examkit.toml"))
}

/// Load configuration from `path` (or the default location), falling back
/// to defaults when the file does not exist.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        CliConfig::default()
    };

    config.config_path = config_path;

    config
        .client
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_path))?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "examkit", "examkit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use examkit_core::StoreBackend;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("examkit.toml");
        std::fs::write(
            &path,
            format!(
                r#"
                base_url = "https://exams.example.com/api"
                store = "memory"
                log_level = "debug"
                data_dir = {:?}
                "#,
                dir.path().join("data")
            ),
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.client.base_url, "https://exams.example.com/api");
        assert_eq!(config.client.store, StoreBackend::Memory);
        assert_eq!(config.client.log_level, "debug");
        assert_eq!(config.client.request_timeout_secs, 10);
        assert_eq!(config.config_path, path);
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn test_unset_fields_use_client_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("examkit.toml");
        std::fs::write(&path, format!("data_dir = {:?}", dir.path().join("data"))).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.client, ClientConfig::default());
        assert_eq!(config.data_dir(), dir.path().join("data"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("examkit.toml");
        std::fs::write(&path, r#"base_url = "nope""#).unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("base_url"));
    }
}

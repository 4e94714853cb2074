//! Configuration loading

use nvmedev_backends::{FabricConfig, FileConfig, KblkConfig, UpciConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "nvmedev.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure, one section per backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kblk: KblkConfig,
    #[serde(default)]
    pub upci: UpciConfig,
    #[serde(default)]
    pub fab: FabricConfig,
    #[serde(default)]
    pub file: FileConfig,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config = Config::from_toml(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<(), ConfigError> {
    let content = Config::default().to_toml()?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvmedev_backends::TransportType;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.kblk.enabled);
        assert_eq!(config.kblk.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.file.lba_nbytes, 512);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
[kblk]
dev_root = "/tmp/dev"

[fab]
enabled = false

[[fab.targets]]
address = "10.0.0.1"
subnqn = "nqn.2016-06.io.spdk:cnode1"

[file]
search_dirs = ["/var/lib/images"]
zone_nlbas = 4096
"#,
        )
        .unwrap();

        assert!(config.kblk.enabled);
        assert_eq!(config.kblk.dev_root, PathBuf::from("/tmp/dev"));
        assert_eq!(config.kblk.sysfs_root, PathBuf::from("/sys"));
        assert!(!config.fab.enabled);
        assert_eq!(config.fab.targets[0].transport, TransportType::Rdma);
        assert_eq!(config.fab.targets[0].port, "4420");
        assert_eq!(config.file.zone_nlbas, Some(4096));
        assert_eq!(config.upci.drivers, vec!["vfio-pci", "uio_pci_generic"]);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        save_default_config(&path).unwrap();
        assert_eq!(load_config(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[kblk\nenabled = maybe").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}

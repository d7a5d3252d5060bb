use crate::CoreError;
use ferry_registry::{PackageOptions, Platform, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Settings read from `~/.config/ferry/config.toml`. Every field is optional.
///
/// ```toml
/// max_concurrent_builds = 2
/// image_workers = 4
/// fetch_timeout_secs = 300
/// platform = "linux/amd64"
///
/// [registry]
/// insecure = ["registry.local:5000"]
///
/// [[registry.auth]]
/// host = "ghcr.io"
/// token = "..."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FerryConfig {
    pub max_concurrent_builds: usize,
    pub image_workers: usize,
    pub fetch_timeout_secs: u64,
    pub platform: String,
    pub registry: RegistryConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 2,
            image_workers: 4,
            fetch_timeout_secs: 300,
            platform: "linux/amd64".to_owned(),
            registry: RegistryConfig::default(),
        }
    }
}

impl FerryConfig {
    /// Load the default config file; a missing file yields the defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_builds == 0 {
            return Err(CoreError::Config(
                "max_concurrent_builds must be at least 1".to_owned(),
            ));
        }
        if self.image_workers == 0 {
            return Err(CoreError::Config("image_workers must be at least 1".to_owned()));
        }
        self.target_platform()?;
        Ok(())
    }

    pub fn target_platform(&self) -> Result<Platform, CoreError> {
        Ok(Platform::parse(&self.platform)?)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Packaging options for one build.
    pub fn package_options(&self, cancel: Arc<AtomicBool>) -> Result<PackageOptions, CoreError> {
        Ok(PackageOptions {
            workers: self.image_workers,
            timeout: self.fetch_timeout(),
            platform: self.target_platform()?,
            cancel: Some(cancel),
        })
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config/ferry/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = FerryConfig::parse("").unwrap();
        assert_eq!(config, FerryConfig::default());
        assert_eq!(config.max_concurrent_builds, 2);
        assert_eq!(config.image_workers, 4);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn registry_table_is_read() {
        let config = FerryConfig::parse(
            r#"
max_concurrent_builds = 3
platform = "linux/arm64/v8"

[registry]
insecure = ["registry.local:5000"]

[[registry.auth]]
host = "ghcr.io"
token = "abc"
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_builds, 3);
        assert_eq!(config.target_platform().unwrap().variant.as_deref(), Some("v8"));
        assert!(config.registry.is_insecure("registry.local:5000"));
        assert_eq!(config.registry.token_for("ghcr.io"), Some("abc"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(FerryConfig::parse("max_concurrent_builds = 0").is_err());
        assert!(FerryConfig::parse("platform = \"amd64\"").is_err());
        assert!(FerryConfig::parse("image_workers = \"four\"").is_err());
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = FerryConfig::default();
        config.fetch_timeout_secs = 42;
        config.save(&path).unwrap();
        assert_eq!(FerryConfig::load(&path).unwrap(), config);
    }
}

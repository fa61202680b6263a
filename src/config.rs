//! Configuration management for packagefs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default per-user layer root; `{user}` expands to the caller's login name
pub const DEFAULT_USER_ROOT_TEMPLATE: &str = "/home/{user}/Packages";

/// Default system-wide layer root
pub const DEFAULT_SYSTEM_ROOT: &str = "/Computer/System/Packages";

/// Default prefix for auto-created containers
pub const DEFAULT_CONTAINER_PREFIX: &str = "Unsorted-";

/// Default window during which new files share one container
pub const DEFAULT_NEW_CONTAINER_INTERVAL_SECS: u64 = 30;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layer roots
    pub layers: LayerConfig,

    /// New-container allocation
    pub allocator: AllocatorConfig,

    /// Optional container enumeration cache
    pub cache: CacheConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Layer root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Template for the primary (per-user) layer root.
    /// Supports `{user}` (login name) and `{uid}` (numeric id).
    pub user_root_template: String,

    /// Fallback (system-wide) layer root
    pub system_root: PathBuf,
}

/// New-container allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Container name prefix; the counter value is appended
    pub container_prefix: String,

    /// Seconds that must elapse before a write opens a new container
    pub interval_secs: u64,

    /// Permission bits for created containers
    pub dir_mode: u32,
}

/// Container cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memoize container enumeration per layer root
    pub enabled: bool,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Attribute/entry cache TTL handed to the kernel
    pub attr_ttl_secs: u64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            user_root_template: DEFAULT_USER_ROOT_TEMPLATE.to_string(),
            system_root: PathBuf::from(DEFAULT_SYSTEM_ROOT),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            interval_secs: DEFAULT_NEW_CONTAINER_INTERVAL_SECS,
            dir_mode: 0o755,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/Packages"),
            allow_other: true,
            allow_root: false,
            fs_name: "packagefs".to_string(),
            attr_ttl_secs: 1,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults plus environment overrides
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment variable overrides applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`; unparsable values are ignored
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(template) = lookup("PACKAGEFS_USER_ROOT") {
            let template = template.trim().to_string();
            if !template.is_empty() {
                self.layers.user_root_template = template;
            }
        }

        if let Some(root) = lookup("PACKAGEFS_SYSTEM_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.layers.system_root = PathBuf::from(root);
            }
        }

        if let Some(prefix) = lookup("PACKAGEFS_CONTAINER_PREFIX") {
            let prefix = prefix.trim().to_string();
            if !prefix.is_empty() {
                self.allocator.container_prefix = prefix;
            }
        }

        if let Some(interval) = lookup("PACKAGEFS_INTERVAL_SECS") {
            if let Ok(secs) = interval.trim().parse::<u64>() {
                self.allocator.interval_secs = secs;
            }
        }

        if let Some(cache) = lookup("PACKAGEFS_CACHE") {
            match cache.trim() {
                "1" | "true" | "on" => self.cache.enabled = true,
                "0" | "false" | "off" => self.cache.enabled = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.layers.user_root_template.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "User root template must not be empty".to_string(),
            ));
        }

        if !self.layers.system_root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "System root must be an absolute path: {:?}",
                self.layers.system_root
            )));
        }

        if self.allocator.container_prefix.is_empty() {
            return Err(Error::InvalidConfig(
                "Container prefix must not be empty".to_string(),
            ));
        }

        if self.allocator.container_prefix.contains('/') {
            return Err(Error::InvalidConfig(
                "Container prefix must not contain '/'".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.layers.user_root_template, "/home/{user}/Packages");
        assert_eq!(
            config.layers.system_root,
            PathBuf::from("/Computer/System/Packages")
        );
        assert_eq!(config.allocator.container_prefix, "Unsorted-");
        assert_eq!(config.allocator.interval_secs, 30);
        assert!(!config.cache.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.allocator.container_prefix = "Batch-".to_string();
        config.layers.system_root = PathBuf::from("/opt/packages");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.layers.system_root, PathBuf::from("/opt/packages"));
        assert_eq!(loaded.allocator.interval_secs, 30);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "allocator": { "interval_secs": 5 } }"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.allocator.interval_secs, 5);
        assert_eq!(loaded.allocator.container_prefix, "Unsorted-");
        assert_eq!(loaded.mount.fs_name, "packagefs");
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = Config::default();
        config.allocator.container_prefix = "a/b".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.allocator.container_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_system_root() {
        let mut config = Config::default();
        config.layers.system_root = PathBuf::from("Packages");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("PACKAGEFS_USER_ROOT", " /data/{uid}/Packages "),
            ("PACKAGEFS_SYSTEM_ROOT", "/opt/Packages"),
            ("PACKAGEFS_CONTAINER_PREFIX", "New-"),
            ("PACKAGEFS_INTERVAL_SECS", " 5 "),
            ("PACKAGEFS_CACHE", "on"),
        ]));

        assert_eq!(config.layers.user_root_template, "/data/{uid}/Packages");
        assert_eq!(config.layers.system_root, PathBuf::from("/opt/Packages"));
        assert_eq!(config.allocator.container_prefix, "New-");
        assert_eq!(config.allocator.interval_secs, 5);
        assert!(config.cache.enabled);

        config.apply_overrides(overrides(&[("PACKAGEFS_CACHE", "0")]));
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_garbage_overrides_are_ignored() {
        let mut config = Config::default();
        config.cache.enabled = true;
        config.apply_overrides(overrides(&[
            ("PACKAGEFS_INTERVAL_SECS", "soon"),
            ("PACKAGEFS_CACHE", "maybe"),
            ("PACKAGEFS_CONTAINER_PREFIX", "   "),
            ("PACKAGEFS_SYSTEM_ROOT", ""),
        ]));

        assert_eq!(config.allocator.interval_secs, 30);
        assert!(config.cache.enabled);
        assert_eq!(config.allocator.container_prefix, "Unsorted-");
        assert_eq!(
            config.layers.system_root,
            PathBuf::from("/Computer/System/Packages")
        );

        config.apply_overrides(overrides(&[("PACKAGEFS_INTERVAL_SECS", "-3")]));
        assert_eq!(config.allocator.interval_secs, 30);
    }
}

//! Storage backing selection
//!
//! The store backend is chosen at process start from an explicit config
//! struct. `RELAY_STORAGE_BACKING` selects the backend and
//! `RELAY_STORAGE_LABEL` namespaces multi-tenant stores; the label is a
//! subdirectory for the filesystem backend and a key prefix for the
//! key-value backend.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable selecting the backend
pub const BACKING_ENV: &str = "RELAY_STORAGE_BACKING";

/// Environment variable carrying the namespace label
pub const LABEL_ENV: &str = "RELAY_STORAGE_LABEL";

/// Invalid storage configuration
#[derive(Debug, Error)]
pub enum StorageConfigError {
    /// Unrecognized backing name
    #[error("unknown storage backing {0:?} (expected \"fs\" or \"redis\")")]
    UnknownBacking(String),
}

/// Available store backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StorageBacking {
    /// Files under a per-label directory tree
    #[default]
    Fs,
    /// Key-value store, namespaced by label
    Redis,
}

impl StorageBacking {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBacking::Fs => "fs",
            StorageBacking::Redis => "redis",
        }
    }
}

impl fmt::Display for StorageBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBacking {
    type Err = StorageConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" => Ok(StorageBacking::Fs),
            "redis" => Ok(StorageBacking::Redis),
            other => Err(StorageConfigError::UnknownBacking(other.to_string())),
        }
    }
}

/// Store backend configuration
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Selected backend
    pub backing: StorageBacking,
    /// Namespace for multi-tenant stores; empty by default
    pub label: String,
    /// Filesystem backend root
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backing: StorageBacking::default(),
            label: String::new(),
            root: default_root(),
        }
    }
}

impl StorageConfig {
    /// Read backing and label from the environment, falling back to
    /// defaults for unset variables
    pub fn from_env() -> Result<Self, StorageConfigError> {
        let backing = match std::env::var(BACKING_ENV) {
            Ok(value) => value.parse()?,
            Err(_) => StorageBacking::default(),
        };
        let label = std::env::var(LABEL_ENV).unwrap_or_default();

        Ok(Self {
            backing,
            label,
            root: default_root(),
        })
    }

    /// Filesystem directory for this label
    pub fn label_root(&self) -> PathBuf {
        if self.label.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.label)
        }
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".librelay")
        .join("storage")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_parse() {
        assert_eq!("fs".parse::<StorageBacking>().unwrap(), StorageBacking::Fs);
        assert_eq!(
            "redis".parse::<StorageBacking>().unwrap(),
            StorageBacking::Redis
        );
        assert!("sqlite".parse::<StorageBacking>().is_err());
    }

    #[test]
    fn test_label_root() {
        let config = StorageConfig {
            label: "tenant-a".to_string(),
            ..Default::default()
        };
        assert!(config.label_root().ends_with("tenant-a"));

        let unlabeled = StorageConfig::default();
        assert_eq!(unlabeled.label_root(), unlabeled.root);
    }
}

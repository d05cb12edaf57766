// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration persistence for k8s-replicator
//!
//! Stores the cache scoping settings in a config file.
//! All k8s-replicator data is stored under ~/.k8s-replicator/:
//! - ~/.k8s-replicator/config.json - user configuration
//! - ~/.k8s-replicator/log/ - log files

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kubernetes::resources::{TrackedKind, parse_kinds};
use crate::kubernetes::selector::{LabelRequirement, parse_requirements};

const DEFAULT_RESYNC_PERIOD_SECS: u64 = 300;

/// Get the base k8s-replicator directory (~/.k8s-replicator/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".k8s-replicator"))
        .context("Could not determine home directory")
}

/// k8s-replicator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Kubeconfig context; inferred when unset
    #[serde(default)]
    pub context: Option<String>,

    /// Mandatory label selector for tracked resources
    #[serde(default = "default_resource_selector")]
    pub resource_selector: String,

    /// Mandatory label selector for namespaces
    #[serde(default)]
    pub namespace_selector: String,

    /// Full re-list interval in seconds
    #[serde(default = "default_resync_period_secs")]
    pub resync_period_secs: u64,

    /// Resource kinds cached in the resource group
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
}

fn default_resource_selector() -> String {
    "replicator.nadundesilva.github.io/object-type=replicated".to_string()
}

fn default_resync_period_secs() -> u64 {
    DEFAULT_RESYNC_PERIOD_SECS
}

fn default_resources() -> Vec<String> {
    TrackedKind::all().iter().map(|k| k.name().to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context: None,
            resource_selector: default_resource_selector(),
            namespace_selector: String::new(),
            resync_period_secs: DEFAULT_RESYNC_PERIOD_SECS,
            resources: default_resources(),
        }
    }
}

impl Config {
    /// Load config from disk, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the config file path (~/.k8s-replicator/config.json)
    pub fn config_path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.json"))
    }

    pub fn resource_requirements(&self) -> Result<Vec<LabelRequirement>> {
        parse_requirements(&self.resource_selector).with_context(|| {
            format!("Invalid resource selector '{}'", self.resource_selector)
        })
    }

    pub fn namespace_requirements(&self) -> Result<Vec<LabelRequirement>> {
        parse_requirements(&self.namespace_selector).with_context(|| {
            format!("Invalid namespace selector '{}'", self.namespace_selector)
        })
    }

    pub fn resync_period(&self) -> Result<Duration> {
        if self.resync_period_secs == 0 {
            bail!("Invalid resync period: must be at least 1 second");
        }
        Ok(Duration::from_secs(self.resync_period_secs))
    }

    pub fn tracked_kinds(&self) -> Result<Vec<TrackedKind>> {
        parse_kinds(&self.resources.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::selector::Operator;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.context.is_none());
        assert!(config.namespace_selector.is_empty());
        assert_eq!(config.resync_period().unwrap(), Duration::from_secs(300));
        assert_eq!(
            config.tracked_kinds().unwrap(),
            vec![TrackedKind::ConfigMaps, TrackedKind::Secrets]
        );
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_deserialize() {
        let json = r#"{
            "context": "prod",
            "resource_selector": "replicate=true",
            "namespace_selector": "team in (platform,infra)",
            "resync_period_secs": 60,
            "resources": ["secrets"]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.context.as_deref(), Some("prod"));
        assert_eq!(config.resync_period().unwrap(), Duration::from_secs(60));
        assert_eq!(config.tracked_kinds().unwrap(), vec![TrackedKind::Secrets]);

        let namespace = config.namespace_requirements().unwrap();
        assert_eq!(namespace.len(), 1);
        assert_eq!(namespace[0].operator(), Operator::In);
    }

    #[test]
    fn test_default_resource_selector_parses() {
        let reqs = Config::default().resource_requirements().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].key(), "replicator.nadundesilva.github.io/object-type");
    }

    #[test]
    fn test_invalid_selector_is_error() {
        let config = Config {
            namespace_selector: "team in (".to_string(),
            ..Config::default()
        };
        let err = config.namespace_requirements().unwrap_err();
        assert!(err.to_string().contains("Invalid namespace selector"));
    }

    #[test]
    fn test_zero_resync_period_is_error() {
        let config: Config = serde_json::from_str(r#"{"resync_period_secs": 0}"#).unwrap();
        let err = config.resync_period().unwrap_err();
        assert!(err.to_string().contains("resync period"));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let config = Config {
            context: Some("test-cluster".to_string()),
            resync_period_secs: 30,
            ..Config::default()
        };
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&temp_dir.path().join("missing.json")).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_config_load_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}

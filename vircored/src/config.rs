//! Configuration loading for the daemon (§10.3).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::Args;

/// Top-level configuration, loaded from YAML and then overridden by
/// CLI flags (§10.3).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub driver: DriverSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            driver: DriverSection::default(),
        }
    }
}

/// Node identity (§10.3 "node identity").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: Option<String>,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            log_level: "info".to_string(),
        }
    }
}

/// Everything the driver core needs at startup (§4.10 step 1-6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub base_dir: Option<PathBuf>,
    pub session: bool,
    pub hypervisor_binary: String,
    pub migration_port_min: u16,
    pub migration_port_max: u16,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            session: false,
            hypervisor_binary: "/usr/bin/qemu-system-x86_64".to_string(),
            migration_port_min: 49152,
            migration_port_max: 49215,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(anyhow::anyhow!("config file not found: {}", path.display()));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "failed to parse config file")?;
        Ok(config)
    }

    /// Apply CLI overrides on top of the loaded (or default) config.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        self.node.log_level = args.log_level.clone();
        self.driver.session = self.driver.session || args.session;
        self
    }

    pub fn resolved_base_dir(&self) -> PathBuf {
        self.driver
            .base_dir
            .clone()
            .unwrap_or_else(|| vircore_driver::paths::default_base_dir(!self.driver.session))
    }
}

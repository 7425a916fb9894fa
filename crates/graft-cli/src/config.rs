//! Host configuration
//!
//! ```toml
//! log_filter = "info,graft_plugins=debug"
//!
//! [hot_reload]
//! cleanup_delay_ms = 500
//!
//! [[plugins]]
//! name = "counter"
//! module = "target/debug/libcounter.so"
//! ```

use crate::error::CliError;
use graft_kernel::HotReloadConfig;
use graft_kernel::config::load_config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level `graft run` configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GraftConfig {
    /// Tracing filter used when neither `RUST_LOG` nor `--verbose` is given
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

/// One plugin to cold-start on launch
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    /// Module library, relative to the configuration file
    pub module: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl GraftConfig {
    /// Load from `path`, resolving module paths against its directory.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let mut config: GraftConfig = load_config(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for plugin in &mut config.plugins {
            if plugin.module.is_relative() {
                plugin.module = base.join(&plugin.module);
            }
        }
        Ok(config)
    }
}

//! Plugin records, hot-reload configuration and reload events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Descriptive information about a managed plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, unique within a host
    pub name: String,
    /// Version of the currently loaded module
    pub version: String,
    /// Plugin description
    #[serde(default)]
    pub description: String,
    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,
}

impl PluginInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            description: String::new(),
            author: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }
}

/// Hot-reload configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Grace delay before the old module files are deleted
    pub cleanup_delay_ms: u64,
    /// Maximum reclaim passes waiting for old objects to be released
    pub reclaim_passes: u32,
    /// Extension of the companion debug-symbol file
    pub debug_symbol_extension: String,
    /// Delete the old module binary and symbols after a successful reload
    pub remove_old_modules: bool,
    /// Re-register the old instance's commands when a reload fails before
    /// the instance is replaced
    pub restore_commands_on_failure: bool,
    /// Refuse libraries built against another module API version
    pub verify_api_version: bool,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: 2000,
            reclaim_passes: 50,
            debug_symbol_extension: "pdb".to_string(),
            remove_old_modules: true,
            restore_commands_on_failure: false,
            verify_api_version: true,
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_reclaim_passes(mut self, passes: u32) -> Self {
        self.reclaim_passes = passes;
        self
    }

    pub fn with_debug_symbol_extension(mut self, extension: &str) -> Self {
        self.debug_symbol_extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_remove_old_modules(mut self, enabled: bool) -> Self {
        self.remove_old_modules = enabled;
        self
    }

    pub fn with_restore_commands_on_failure(mut self, enabled: bool) -> Self {
        self.restore_commands_on_failure = enabled;
        self
    }

    pub fn with_verify_api_version(mut self, enabled: bool) -> Self {
        self.verify_api_version = enabled;
        self
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

/// Phases of one reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ReloadPhase {
    Idle,
    /// Tearing down the old instance's commands
    Unregistering,
    /// Loading the replacement module
    Loading,
    /// Constructing a fresh instance
    ColdStart,
    /// Migrating the old graph into the replacement types
    Migrating,
    /// Installing the new instance's commands
    Registering,
    /// Running hot-reload notifications
    Notifying,
    /// Retiring the old module
    Finalizing,
    /// The last reload failed
    Aborted,
}

impl fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReloadPhase::Idle => "idle",
            ReloadPhase::Unregistering => "unregistering",
            ReloadPhase::Loading => "loading",
            ReloadPhase::ColdStart => "cold-start",
            ReloadPhase::Migrating => "migrating",
            ReloadPhase::Registering => "registering",
            ReloadPhase::Notifying => "notifying",
            ReloadPhase::Finalizing => "finalizing",
            ReloadPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Whether a reload constructed or migrated the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReloadKind {
    ColdStart,
    HotReload,
}

impl fmt::Display for ReloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadKind::ColdStart => f.write_str("cold start"),
            ReloadKind::HotReload => f.write_str("hot reload"),
        }
    }
}

/// Hot-reload event
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadEvent {
    /// Reload started
    ReloadStarted { plugin: String, path: PathBuf },
    /// Reload entered a new phase
    PhaseChanged { plugin: String, phase: ReloadPhase },
    /// Reload completed
    ReloadCompleted {
        plugin: String,
        path: PathBuf,
        kind: ReloadKind,
        commands: usize,
        duration: Duration,
    },
    /// Reload failed
    ReloadFailed {
        plugin: String,
        path: PathBuf,
        phase: ReloadPhase,
        error: String,
    },
    /// Old commands re-registered after a failed reload
    CommandsRestored { plugin: String, commands: usize },
    /// Old module unloaded
    ModuleRetired {
        plugin: String,
        path: PathBuf,
        leaked: bool,
    },
    /// Old module file could not be deleted
    CleanupWarning {
        plugin: String,
        path: PathBuf,
        reason: String,
    },
}

impl ReloadEvent {
    /// Name of the plugin the event concerns
    pub fn plugin(&self) -> &str {
        match self {
            ReloadEvent::ReloadStarted { plugin, .. }
            | ReloadEvent::PhaseChanged { plugin, .. }
            | ReloadEvent::ReloadCompleted { plugin, .. }
            | ReloadEvent::ReloadFailed { plugin, .. }
            | ReloadEvent::CommandsRestored { plugin, .. }
            | ReloadEvent::ModuleRetired { plugin, .. }
            | ReloadEvent::CleanupWarning { plugin, .. } => plugin,
        }
    }
}

//! Graft plugins
//!
//! Host-side plugin management for graft: plugin modules are loaded from
//! disk, and replaced at runtime by [`hot_reload::HotReloadManager`] without
//! losing the state of the running instance.

pub mod hot_reload;

pub use graft_kernel::{
    CommandRegistry, CommandTable, Handle, HotReloadConfig, ModuleManifest, PluginInfo, Reflect,
    ReloadEvent, ReloadKind, ReloadPhase, TypeSchema,
};
pub use hot_reload::{HotReloadManager, ReloadError, ReloadOutcome, ReloadResult};

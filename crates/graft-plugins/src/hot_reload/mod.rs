//! Hot-reload plugin support module
//!
//! Replaces a running plugin with a freshly built module while keeping its
//! state:
//! - Isolated, unloadable module contexts
//! - Field-by-field migration of the live object graph
//! - Command re-registration against the new code
//! - Deferred retirement of the old module and its files

mod adapter;
mod cleanup;
mod context;
mod loader;
mod manager;
mod walker;

pub use adapter::{MigrationError, adapt_instance};
pub use cleanup::{
    Artifact, ArtifactKind, CleanupReport, FileCleanupWarning, Retirement, StaleArtifacts,
    debug_symbol_path, reclaim, remove_artifact,
};
pub use context::MigrationContext;
pub use loader::{
    DylibSource, IsolatedContext, LoadError, LoadedModule, ModuleSource, StaticModules,
};
pub use manager::{
    HotReloadManager, IntoReloadReport, Plugin, ReloadError, ReloadOutcome, ReloadResult,
};
pub use walker::{WalkSummary, register_commands, unregister_commands, walk};

// Re-export kernel hot reload definitions
pub use graft_kernel::plugin::{HotReloadConfig, ReloadEvent, ReloadKind, ReloadPhase};

use std::any::Any;

/// Human-readable payload of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

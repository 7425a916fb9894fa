//! Name-keyed command table
//!
//! The reload engine installs and removes plugin commands through the
//! [`CommandTable`] trait; [`CommandRegistry`] is the in-process implementation
//! used by the `graft` host.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Uniform command callback: receives the argument list, reports success.
pub type CommandCallback = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Command table errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandError {
    /// Another handler already owns this name
    #[error("Command '{0}' is already registered")]
    AlreadyRegistered(String),

    /// No handler owns this name
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Debug-only command dispatched while no debuggee is active
    #[error("Command '{0}' requires an active debuggee")]
    RequiresDebuggee(String),

    /// Empty or whitespace-containing command name
    #[error("Invalid command name '{0}'")]
    InvalidName(String),
}

/// Command table consumed by the reload engine.
pub trait CommandTable: Send + Sync {
    /// Register `callback` under `name`. Names are unique.
    fn register(
        &self,
        name: &str,
        debug_only: bool,
        callback: CommandCallback,
    ) -> Result<(), CommandError>;

    /// Remove the handler for `name`. Returns whether one was registered.
    fn remove(&self, name: &str) -> bool;
}

struct CommandEntry {
    debug_only: bool,
    callback: CommandCallback,
}

/// Thread-safe command registry.
#[derive(Default)]
pub struct CommandRegistry {
    entries: RwLock<HashMap<String, CommandEntry>>,
    debuggee_active: AtomicBool,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the command `name`.
    ///
    /// The callback runs outside the table lock, so a handler may itself
    /// register or remove commands.
    pub fn execute(&self, name: &str, args: &[String]) -> Result<bool, CommandError> {
        let callback = {
            let entries = self.entries.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
            if entry.debug_only && !self.is_debuggee_active() {
                return Err(CommandError::RequiresDebuggee(name.to_string()));
            }
            Arc::clone(&entry.callback)
        };
        Ok(callback(args))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn is_debug_only(&self, name: &str) -> Option<bool> {
        self.entries.read().get(name).map(|entry| entry.debug_only)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn set_debuggee_active(&self, active: bool) {
        self.debuggee_active.store(active, Ordering::SeqCst);
    }

    pub fn is_debuggee_active(&self) -> bool {
        self.debuggee_active.load(Ordering::SeqCst)
    }
}

impl CommandTable for CommandRegistry {
    fn register(
        &self,
        name: &str,
        debug_only: bool,
        callback: CommandCallback,
    ) -> Result<(), CommandError> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(CommandError::InvalidName(name.to_string()));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(CommandError::AlreadyRegistered(name.to_string()));
        }
        debug!("Registered command '{}' (debug_only: {})", name, debug_only);
        entries.insert(
            name.to_string(),
            CommandEntry {
                debug_only,
                callback,
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            debug!("Removed command '{}'", name);
        }
        removed
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .field("debuggee_active", &self.is_debuggee_active())
            .finish()
    }
}

//! Graft kernel
//!
//! Stable host-side contracts shared by the reload engine and by plugin
//! modules:
//! - declarative object schemas ([`object`]) standing in for runtime reflection
//! - the name-keyed command table ([`command`])
//! - the module boundary exported by plugin libraries ([`module`])
//! - plugin records, reload configuration and events ([`plugin`])

// object module
pub mod object;
pub use object::{
    Capability, CommandOutput, ElementKind, FieldKind, FieldSchema, FieldValue, Handle, Object,
    ObjectKey, ObjectRef, Reflect, SchemaBuilder, TypeSchema,
};

// command module
pub mod command;
pub use command::{CommandCallback, CommandError, CommandRegistry, CommandTable};

// module boundary
pub mod module;
pub use module::{MODULE_API_VERSION, ModuleManifest};

// plugin module
pub mod plugin;
pub use plugin::{HotReloadConfig, PluginInfo, ReloadEvent, ReloadKind, ReloadPhase};

// error module
pub mod error;
pub use error::{FieldError, FieldResult};

// config module
#[cfg(feature = "config")]
pub mod config;

//! Module boundary between the host and a swappable plugin library.
//!
//! A plugin library exposes a [`ModuleManifest`] listing the schemas of its
//! state types. Dynamic libraries export it through [`declare_module!`].

use crate::object::{Reflect, TypeSchema};
use std::fmt;

/// Version of the module boundary. Libraries built against another version
/// are refused.
pub const MODULE_API_VERSION: u32 = 1;

/// Exported symbol returning a boxed [`ModuleManifest`].
pub const MODULE_SYMBOL: &[u8] = b"_graft_module";

/// Exported symbol returning the module's [`MODULE_API_VERSION`].
pub const API_VERSION_SYMBOL: &[u8] = b"_graft_api_version";

/// Types published by one plugin module.
pub struct ModuleManifest {
    name: String,
    version: String,
    types: Vec<&'static TypeSchema>,
}

impl ModuleManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            types: Vec::new(),
        }
    }

    /// Publish `T`.
    pub fn with_type<T: Reflect>(self) -> Self {
        self.with_schema(T::schema())
    }

    pub fn with_schema(mut self, schema: &'static TypeSchema) -> Self {
        if !self.types.iter().any(|known| std::ptr::eq(*known, schema)) {
            self.types.push(schema);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn types(&self) -> &[&'static TypeSchema] {
        &self.types
    }

    /// Published types marked as the command root.
    pub fn entry_types(&self) -> Vec<&'static TypeSchema> {
        self.types
            .iter()
            .copied()
            .filter(|schema| schema.is_entry())
            .collect()
    }

    pub fn find_type(&self, name: &str) -> Option<&'static TypeSchema> {
        self.types.iter().copied().find(|schema| schema.name() == name)
    }
}

impl fmt::Debug for ModuleManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<_> = self.types.iter().map(|schema| schema.name()).collect();
        f.debug_struct("ModuleManifest")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("types", &types)
            .finish()
    }
}

/// Export a module manifest from a plugin library.
///
/// Generates `graft_manifest()` for in-process use plus the `_graft_module`
/// and `_graft_api_version` symbols read by the dynamic loader.
///
/// ```rust,ignore
/// graft_kernel::declare_module!("counter", "0.2.0", [Counter, Stats]);
/// ```
#[macro_export]
macro_rules! declare_module {
    ($name:expr, $version:expr, [$($ty:ty),* $(,)?]) => {
        pub fn graft_manifest() -> $crate::module::ModuleManifest {
            $crate::module::ModuleManifest::new($name, $version)
                $(.with_type::<$ty>())*
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _graft_module() -> *mut $crate::module::ModuleManifest {
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(graft_manifest()))
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _graft_api_version() -> u32 {
            $crate::module::MODULE_API_VERSION
        }
    };
}

//! Isolated module loader
//!
//! Loads plugin modules from shared libraries (or from an in-process table in
//! hosts and tests that link their modules statically) into an
//! [`IsolatedContext`] that can be unloaded independently.

use graft_kernel::module::{API_VERSION_SYMBOL, MODULE_API_VERSION, MODULE_SYMBOL};
use graft_kernel::{ModuleManifest, TypeSchema};
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Module load error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Module file not found: {0:?}")]
    Missing(PathBuf),

    #[error("Failed to load library {path:?}: {reason}")]
    LibraryLoad { path: PathBuf, reason: String },

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid module: {0}")]
    InvalidModule(String),

    #[error("Module '{module}' has no entry type")]
    NoEntryType { module: String },

    #[error("Module '{module}' has multiple entry types ({}), can have only one", types.join(", "))]
    MultipleEntryTypes { module: String, types: Vec<String> },

    #[error("No in-process module registered for {0:?}")]
    NotRegistered(PathBuf),

    #[error("Load context {0} already holds a module")]
    AlreadyLoaded(Uuid),

    #[error("Load context {0} was unloaded")]
    ContextUnloaded(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A module opened from disk.
pub struct LoadedModule {
    // Declared before `library` so the manifest is released while its code is
    // still mapped.
    manifest: Box<ModuleManifest>,
    path: PathBuf,
    hash: String,
    loaded_at: Instant,
    library: Option<Library>,
}

impl LoadedModule {
    /// Wrap a manifest linked into the host.
    pub fn in_process(path: impl Into<PathBuf>, hash: String, manifest: ModuleManifest) -> Self {
        Self {
            manifest: Box::new(manifest),
            path: path.into(),
            hash,
            loaded_at: Instant::now(),
            library: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 of the module file
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Whether the module's code lives in a shared library.
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }

    /// The single type marked as the module's command root.
    pub fn entry_type(&self) -> Result<&'static TypeSchema, LoadError> {
        let entries = self.manifest.entry_types();
        match entries.as_slice() {
            [entry] => Ok(*entry),
            [] => Err(LoadError::NoEntryType {
                module: self.manifest.name().to_string(),
            }),
            many => Err(LoadError::MultipleEntryTypes {
                module: self.manifest.name().to_string(),
                types: many.iter().map(|schema| schema.name().to_string()).collect(),
            }),
        }
    }

    /// Keep the library mapped for the rest of the process.
    fn leak(mut self) {
        if let Some(library) = self.library.take() {
            warn!("Leaking module library: {:?}", self.path);
            std::mem::forget(library);
        }
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        debug!("Unloading module: {:?}", self.path);
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("path", &self.path)
            .field("hash", &self.hash)
            .field("manifest", &self.manifest)
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

/// Opens module files.
pub trait ModuleSource: Send + Sync {
    fn open(&self, path: &Path) -> Result<LoadedModule, LoadError>;
}

fn calculate_hash(path: &Path) -> Result<String, LoadError> {
    let contents = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

fn ensure_exists(path: &Path) -> Result<(), LoadError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(LoadError::Missing(path.to_path_buf()))
    }
}

/// Loads modules from shared libraries exporting [`graft_kernel::declare_module!`] symbols.
#[derive(Debug, Clone)]
pub struct DylibSource {
    verify_api_version: bool,
}

impl DylibSource {
    pub fn new(verify_api_version: bool) -> Self {
        Self { verify_api_version }
    }
}

impl Default for DylibSource {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ModuleSource for DylibSource {
    fn open(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        ensure_exists(path)?;
        info!("Loading module library: {:?}", path);

        let hash = calculate_hash(path)?;

        let library = unsafe {
            Library::new(path).map_err(|e| LoadError::LibraryLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        let api_version = unsafe {
            let version_fn: Result<Symbol<unsafe extern "C" fn() -> u32>, _> =
                library.get(API_VERSION_SYMBOL);
            match version_fn {
                Ok(func) => func(),
                Err(_) => MODULE_API_VERSION,
            }
        };

        if self.verify_api_version && api_version != MODULE_API_VERSION {
            return Err(LoadError::VersionMismatch {
                expected: MODULE_API_VERSION,
                actual: api_version,
            });
        }

        let manifest = unsafe {
            let module_fn: Symbol<unsafe extern "C" fn() -> *mut ModuleManifest> = library
                .get(MODULE_SYMBOL)
                .map_err(|e| LoadError::SymbolNotFound(format!("_graft_module: {}", e)))?;
            let raw = module_fn();
            if raw.is_null() {
                return Err(LoadError::InvalidModule(
                    "Module manifest is null".to_string(),
                ));
            }
            Box::from_raw(raw)
        };

        info!(
            "Loaded module: {} v{} ({} types)",
            manifest.name(),
            manifest.version(),
            manifest.types().len()
        );

        Ok(LoadedModule {
            manifest,
            path: path.to_path_buf(),
            hash,
            loaded_at: Instant::now(),
            library: Some(library),
        })
    }
}

/// Module factories linked into the host, keyed by module file path.
///
/// The file must still exist; its content only feeds the module hash.
#[derive(Default)]
pub struct StaticModules {
    factories: RwLock<HashMap<PathBuf, fn() -> ModuleManifest>>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<PathBuf>, factory: fn() -> ModuleManifest) {
        self.factories.write().insert(path.into(), factory);
    }

    pub fn with_module(self, path: impl Into<PathBuf>, factory: fn() -> ModuleManifest) -> Self {
        self.register(path, factory);
        self
    }
}

impl ModuleSource for StaticModules {
    fn open(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        ensure_exists(path)?;
        let factory = self
            .factories
            .read()
            .get(path)
            .copied()
            .ok_or_else(|| LoadError::NotRegistered(path.to_path_buf()))?;

        let hash = calculate_hash(path)?;
        let manifest = factory();
        info!(
            "Loaded in-process module: {} v{} from {:?}",
            manifest.name(),
            manifest.version(),
            path
        );
        Ok(LoadedModule::in_process(path, hash, manifest))
    }
}

impl<S: ModuleSource + ?Sized> ModuleSource for Arc<S> {
    fn open(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        (**self).open(path)
    }
}

/// An unloadable context holding at most one module.
///
/// Unloading is irreversible: a fresh context is needed for the next load.
pub struct IsolatedContext {
    id: Uuid,
    source: Arc<dyn ModuleSource>,
    current: Option<LoadedModule>,
    unloaded: bool,
}

impl IsolatedContext {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            current: None,
            unloaded: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<&LoadedModule, LoadError> {
        if self.unloaded {
            return Err(LoadError::ContextUnloaded(self.id));
        }
        if self.current.is_some() {
            return Err(LoadError::AlreadyLoaded(self.id));
        }
        let module = self.source.open(path)?;
        debug!("Context {} loaded {:?}", self.id, module.path());
        Ok(self.current.insert(module))
    }

    pub fn module(&self) -> Option<&LoadedModule> {
        self.current.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    /// Release the module. Returns whether one was loaded; repeated calls
    /// are no-ops.
    ///
    /// No object created from the module may be alive afterwards.
    pub fn unload_current(&mut self) -> bool {
        self.unloaded = true;
        match self.current.take() {
            Some(module) => {
                info!("Context {} unloaded {:?}", self.id, module.path());
                drop(module);
                true
            }
            None => false,
        }
    }

    /// Retire the context without unmapping the library, for modules whose
    /// objects are still referenced.
    pub fn leak_current(&mut self) -> bool {
        self.unloaded = true;
        match self.current.take() {
            Some(module) => {
                module.leak();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for IsolatedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedContext")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("unloaded", &self.unloaded)
            .finish()
    }
}

//! Hot-reload manager
//!
//! Drives one reload through its phases:
//! unregister old commands, load the new module, construct or migrate the
//! instance, register new commands, notify migrated objects, then retire the
//! old module and schedule deletion of its files.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use error_stack::Report;
use graft_kernel::{
    Capability, CommandTable, HotReloadConfig, ObjectRef, PluginInfo, ReloadEvent, ReloadKind,
    ReloadPhase, TypeSchema,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::adapter::{MigrationError, adapt_instance};
use super::cleanup::{self, Artifact, CleanupReport, Retirement, StaleArtifacts};
use super::context::MigrationContext;
use super::loader::{DylibSource, IsolatedContext, LoadError, ModuleSource};
use super::panic_message;
use super::walker;

/// Error-stack–backed result alias for reload operations.
pub type ReloadResult<T> = ::std::result::Result<T, Report<ReloadError>>;

/// Extension trait to convert `Result<T, ReloadError>` into [`ReloadResult<T>`].
pub trait IntoReloadReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> ReloadResult<T>;
}

impl<T> IntoReloadReport<T> for ::std::result::Result<T, ReloadError> {
    #[inline]
    fn into_report(self) -> ReloadResult<T> {
        self.map_err(Report::new)
    }
}

/// Reload error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReloadError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already registered: {0}")]
    PluginExists(String),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Construction of {type_name} failed: {reason}")]
    Construction { type_name: String, reason: String },

    #[error("Unsupported migration: {0}")]
    UnsupportedMigration(MigrationError),

    #[error("Migration failed: {0}")]
    Migration(MigrationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MigrationError> for ReloadError {
    fn from(err: MigrationError) -> Self {
        if err.is_unsupported() {
            ReloadError::UnsupportedMigration(err)
        } else {
            ReloadError::Migration(err)
        }
    }
}

/// Result of a successful reload
#[derive(Debug)]
pub struct ReloadOutcome {
    /// Plugin name
    pub plugin: String,
    /// Whether the instance was constructed or migrated
    pub kind: ReloadKind,
    /// Entry type of the new module
    pub entry_type: String,
    /// Version of the new module
    pub module_version: String,
    /// Commands registered for the new instance
    pub commands: Vec<String>,
    /// Objects that received the hot-reload notification
    pub notified: usize,
    /// How the previous module was retired, if there was one
    pub retirement: Option<Retirement>,
    /// Time until the new instance was live
    pub duration: Duration,
    /// Deferred deletion of the previous module's files
    pub cleanup: Option<JoinHandle<CleanupReport>>,
}

impl ReloadOutcome {
    /// Wait for the deferred file cleanup, if one was scheduled.
    pub async fn wait_for_cleanup(&mut self) -> Option<CleanupReport> {
        let handle = self.cleanup.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("Cleanup task for '{}' failed: {}", self.plugin, err);
                None
            }
        }
    }
}

#[derive(Default)]
struct PluginSlot {
    instance: Option<ObjectRef>,
    instance_type: Option<String>,
    context: Option<IsolatedContext>,
    module_path: Option<PathBuf>,
    module_hash: Option<String>,
    reload_count: u32,
    last_reload: Option<Instant>,
}

/// A managed plugin: one live instance and the module it came from.
pub struct Plugin {
    info: RwLock<PluginInfo>,
    reload_lock: Mutex<()>,
    slot: RwLock<PluginSlot>,
    phase: RwLock<ReloadPhase>,
}

impl Plugin {
    fn new(info: PluginInfo) -> Self {
        Self {
            info: RwLock::new(info),
            reload_lock: Mutex::new(()),
            slot: RwLock::new(PluginSlot::default()),
            phase: RwLock::new(ReloadPhase::Idle),
        }
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn info(&self) -> PluginInfo {
        self.info.read().clone()
    }

    /// The live root instance.
    ///
    /// Holding on to it across a reload keeps the old module mapped.
    pub fn instance(&self) -> Option<ObjectRef> {
        self.slot.read().instance.clone()
    }

    pub fn instance_type(&self) -> Option<String> {
        self.slot.read().instance_type.clone()
    }

    pub fn module_path(&self) -> Option<PathBuf> {
        self.slot.read().module_path.clone()
    }

    pub fn module_hash(&self) -> Option<String> {
        self.slot.read().module_hash.clone()
    }

    pub fn phase(&self) -> ReloadPhase {
        *self.phase.read()
    }

    /// Successful reloads, cold start included
    pub fn reload_count(&self) -> u32 {
        self.slot.read().reload_count
    }

    pub fn last_reload(&self) -> Option<Instant> {
        self.slot.read().last_reload
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().instance.is_some()
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("Plugin")
            .field("info", &*self.info.read())
            .field("instance_type", &slot.instance_type)
            .field("module_path", &slot.module_path)
            .field("phase", &*self.phase.read())
            .finish()
    }
}

/// Hot-reload manager
pub struct HotReloadManager {
    /// Configuration
    config: HotReloadConfig,
    /// Opens module files
    source: Arc<dyn ModuleSource>,
    /// Command table shared with the host
    commands: Arc<dyn CommandTable>,
    /// Managed plugins
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<ReloadEvent>,
    /// Files whose deletion failed
    stale: StaleArtifacts,
}

impl HotReloadManager {
    /// Create a manager loading modules from shared libraries.
    pub fn new(config: HotReloadConfig, commands: Arc<dyn CommandTable>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            source: Arc::new(DylibSource::new(config.verify_api_version)),
            commands,
            plugins: RwLock::new(HashMap::new()),
            event_tx,
            stale: StaleArtifacts::default(),
            config,
        }
    }

    /// Replace the module source.
    pub fn with_source(mut self, source: Arc<dyn ModuleSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    pub fn commands(&self) -> Arc<dyn CommandTable> {
        Arc::clone(&self.commands)
    }

    /// Subscribe to reload events
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.event_tx.subscribe()
    }

    /// Files waiting for a deletion retry
    pub fn stale_artifacts(&self) -> Vec<Artifact> {
        self.stale.lock().clone()
    }

    /// Register a plugin with no instance yet.
    pub fn add_plugin(&self, info: PluginInfo) -> ReloadResult<Arc<Plugin>> {
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&info.name) {
            return Err(ReloadError::PluginExists(info.name)).into_report();
        }
        debug!("Added plugin: {}", info.name);
        let name = info.name.clone();
        let plugin = Arc::new(Plugin::new(info));
        plugins.insert(name, Arc::clone(&plugin));
        Ok(plugin)
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().get(name).cloned()
    }

    /// Names of all managed plugins, sorted
    pub fn list_plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Reload the plugin `name` from the module at `path`.
    pub async fn reload(&self, name: &str, path: impl AsRef<Path>) -> ReloadResult<ReloadOutcome> {
        let plugin = self
            .get_plugin(name)
            .ok_or_else(|| ReloadError::PluginNotFound(name.to_string()))
            .into_report()?;
        self.reload_plugin(&plugin, path).await
    }

    /// Reload `plugin` from the module at `path`.
    ///
    /// Reloads of one plugin are serialized. On failure the old instance is
    /// kept but its commands stay unregistered unless
    /// [`HotReloadConfig::restore_commands_on_failure`] is set.
    pub async fn reload_plugin(
        &self,
        plugin: &Plugin,
        path: impl AsRef<Path>,
    ) -> ReloadResult<ReloadOutcome> {
        let path = path.as_ref().to_path_buf();
        let _reload = plugin.reload_lock.lock().await;
        let name = plugin.name();
        let start = Instant::now();

        info!("Reloading '{}' from {:?}", name, path);
        self.emit(ReloadEvent::ReloadStarted {
            plugin: name.clone(),
            path: path.clone(),
        });

        let old_instance = plugin.instance();

        // Old handlers go away before the new module is even loaded.
        let old_objects = match &old_instance {
            Some(old) => {
                self.set_phase(plugin, &name, ReloadPhase::Unregistering);
                let summary = walker::unregister_commands(self.commands.as_ref(), old);
                info!("Unregistered {} commands of '{}'", summary.commands.len(), name);
                walker::collect_objects(old)
            }
            None => Vec::new(),
        };

        self.set_phase(plugin, &name, ReloadPhase::Loading);
        // Locals drop in reverse order, so on every early return the new
        // objects go before the module that defines them.
        let mut context = IsolatedContext::new(Arc::clone(&self.source));
        let loaded = context.load_from_file(&path).and_then(|module| {
            let entry = module.entry_type()?;
            Ok((
                entry,
                module.manifest().version().to_string(),
                module.hash().to_string(),
            ))
        });
        let (entry, version, hash) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                return Err(self.abort(
                    plugin,
                    &name,
                    &path,
                    ReloadPhase::Loading,
                    old_instance.as_ref(),
                    err.into(),
                ));
            }
        };
        info!("Entry type: {}", entry.name());

        let mut migration = MigrationContext::new();
        let new_root = migration.create(entry);

        let kind = match &old_instance {
            None => {
                self.set_phase(plugin, &name, ReloadPhase::ColdStart);
                if let Err(err) = cold_start(entry, &new_root) {
                    return Err(self.abort(
                        plugin,
                        &name,
                        &path,
                        ReloadPhase::ColdStart,
                        None,
                        err,
                    ));
                }
                ReloadKind::ColdStart
            }
            Some(old) => {
                self.set_phase(plugin, &name, ReloadPhase::Migrating);
                if let Err(err) = adapt_instance(&mut migration, old, &new_root) {
                    return Err(self.abort(
                        plugin,
                        &name,
                        &path,
                        ReloadPhase::Migrating,
                        Some(old),
                        err.into(),
                    ));
                }
                debug!(
                    "Migrated {} objects of '{}'",
                    migration.new_objects().len(),
                    name
                );
                ReloadKind::HotReload
            }
        };

        // Readers see either the old or the new instance, never a partial one.
        {
            let mut slot = plugin.slot.write();
            slot.instance = Some(new_root.clone());
            slot.instance_type = Some(entry.name().to_string());
        }

        self.set_phase(plugin, &name, ReloadPhase::Registering);
        let registered = walker::register_commands(self.commands.as_ref(), &new_root);

        let notified = match kind {
            ReloadKind::HotReload => {
                self.set_phase(plugin, &name, ReloadPhase::Notifying);
                notify_hotload(&migration)
            }
            ReloadKind::ColdStart => 0,
        };
        drop(migration);
        drop(old_instance);

        let duration = start.elapsed();

        self.set_phase(plugin, &name, ReloadPhase::Finalizing);
        let (old_context, old_path) = {
            let mut slot = plugin.slot.write();
            (slot.context.take(), slot.module_path.clone())
        };

        let mut retirement = None;
        let mut cleanup = None;
        if let Some(old_context) = old_context {
            let retired =
                cleanup::retire_context(old_context, old_objects, self.config.reclaim_passes)
                    .await;
            retirement = Some(retired);

            if let Some(old_path) = old_path {
                self.emit(ReloadEvent::ModuleRetired {
                    plugin: name.clone(),
                    path: old_path.clone(),
                    leaked: retired.leaked,
                });
                if self.config.remove_old_modules {
                    let artifacts = self.artifacts_to_remove(plugin, &old_path, &path);
                    if !artifacts.is_empty() {
                        cleanup = Some(cleanup::schedule_cleanup(
                            name.clone(),
                            artifacts,
                            self.config.cleanup_delay(),
                            Arc::clone(&self.stale),
                            self.event_tx.clone(),
                        ));
                    }
                }
            }
        }

        {
            let mut slot = plugin.slot.write();
            slot.context = Some(context);
            slot.module_path = Some(path.clone());
            slot.module_hash = Some(hash);
            slot.reload_count += 1;
            slot.last_reload = Some(Instant::now());
        }
        plugin.info.write().version = version.clone();
        self.set_phase(plugin, &name, ReloadPhase::Idle);

        info!(
            "Reloaded '{}' ({}, {} commands) in {:?}",
            name,
            kind,
            registered.commands.len(),
            duration
        );
        self.emit(ReloadEvent::ReloadCompleted {
            plugin: name.clone(),
            path,
            kind,
            commands: registered.commands.len(),
            duration,
        });

        Ok(ReloadOutcome {
            plugin: name,
            kind,
            entry_type: entry.name().to_string(),
            module_version: version,
            commands: registered.commands,
            notified,
            retirement,
            duration,
            cleanup,
        })
    }

    /// Unregister a plugin's commands, release its instance and unload its module.
    ///
    /// Module files are left in place.
    pub async fn unload_plugin(&self, name: &str) -> ReloadResult<()> {
        let plugin = self
            .get_plugin(name)
            .ok_or_else(|| ReloadError::PluginNotFound(name.to_string()))
            .into_report()?;
        let _reload = plugin.reload_lock.lock().await;

        info!("Unloading plugin: {}", name);

        let (instance, context, path) = {
            let mut slot = plugin.slot.write();
            slot.instance_type = None;
            (
                slot.instance.take(),
                slot.context.take(),
                slot.module_path.take(),
            )
        };

        let objects = match &instance {
            Some(instance) => {
                walker::unregister_commands(self.commands.as_ref(), instance);
                walker::collect_objects(instance)
            }
            None => Vec::new(),
        };
        drop(instance);

        if let Some(context) = context {
            let retired =
                cleanup::retire_context(context, objects, self.config.reclaim_passes).await;
            self.emit(ReloadEvent::ModuleRetired {
                plugin: name.to_string(),
                path: path.unwrap_or_default(),
                leaked: retired.leaked,
            });
        }

        *plugin.phase.write() = ReloadPhase::Idle;
        self.plugins.write().remove(name);
        Ok(())
    }

    /// Unload every plugin.
    pub async fn shutdown(&self) {
        info!("Shutting down hot-reload manager");
        for name in self.list_plugins() {
            if let Err(report) = self.unload_plugin(&name).await {
                warn!("Failed to unload plugin {}: {:?}", name, report);
            }
        }
    }

    fn emit(&self, event: ReloadEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_phase(&self, plugin: &Plugin, name: &str, phase: ReloadPhase) {
        *plugin.phase.write() = phase;
        debug!("'{}' entered {}", name, phase);
        self.emit(ReloadEvent::PhaseChanged {
            plugin: name.to_string(),
            phase,
        });
    }

    fn abort(
        &self,
        plugin: &Plugin,
        name: &str,
        path: &Path,
        phase: ReloadPhase,
        old_instance: Option<&ObjectRef>,
        error: ReloadError,
    ) -> Report<ReloadError> {
        self.set_phase(plugin, name, ReloadPhase::Aborted);
        error!("Reload of '{}' aborted during {}: {}", name, phase, error);

        if let Some(old) = old_instance {
            if self.config.restore_commands_on_failure {
                let restored = walker::register_commands(self.commands.as_ref(), old);
                info!(
                    "Restored {} commands of the previous '{}' instance",
                    restored.commands.len(),
                    name
                );
                self.emit(ReloadEvent::CommandsRestored {
                    plugin: name.to_string(),
                    commands: restored.commands.len(),
                });
            } else {
                warn!("'{}' has no registered commands until a reload succeeds", name);
            }
        }

        self.emit(ReloadEvent::ReloadFailed {
            plugin: name.to_string(),
            path: path.to_path_buf(),
            phase,
            error: error.to_string(),
        });

        Report::new(error)
            .attach(format!("plugin: {name}"))
            .attach(format!("module: {}", path.display()))
            .attach(format!("phase: {phase}"))
    }

    /// Old files to delete: the replaced module pair plus earlier failures,
    /// never a file another plugin currently runs from.
    fn artifacts_to_remove(
        &self,
        reloaded: &Plugin,
        old_path: &Path,
        new_path: &Path,
    ) -> Vec<Artifact> {
        let extension = &self.config.debug_symbol_extension;
        let mut artifacts: Vec<Artifact> = self.stale.lock().drain(..).collect();

        if old_path == new_path {
            warn!("Module {:?} was reloaded in place, keeping the file", old_path);
        } else {
            artifacts.extend(Artifact::pair(old_path, extension));
        }

        let mut in_use: Vec<PathBuf> = self
            .plugins
            .read()
            .values()
            .filter(|plugin| !std::ptr::eq(Arc::as_ptr(plugin), reloaded))
            .filter_map(|plugin| plugin.module_path())
            .collect();
        in_use.push(new_path.to_path_buf());
        let in_use: Vec<PathBuf> = in_use
            .iter()
            .flat_map(|path| Artifact::pair(path, extension))
            .map(|artifact| artifact.path)
            .collect();

        let mut seen = Vec::new();
        artifacts.retain(|artifact| {
            if in_use.contains(&artifact.path) || seen.contains(&artifact.path) {
                return false;
            }
            seen.push(artifact.path.clone());
            true
        });
        artifacts
    }
}

/// Run the constructor and then the startup hook of a fresh root.
fn cold_start(entry: &'static TypeSchema, root: &ObjectRef) -> Result<(), ReloadError> {
    if entry.has_constructor() {
        run_hook(entry, "constructor", || entry.construct(&mut *root.write()))?;
    }
    if entry.has_startup() {
        run_hook(entry, "startup", || entry.startup(&mut *root.write()))?;
    }
    Ok(())
}

fn run_hook(
    entry: &TypeSchema,
    stage: &str,
    hook: impl FnOnce() -> anyhow::Result<()>,
) -> Result<(), ReloadError> {
    let reason = match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => format!("{stage} failed: {err:#}"),
        Err(panic) => format!("{stage} panicked: {}", panic_message(panic.as_ref())),
    };
    Err(ReloadError::Construction {
        type_name: entry.name().to_string(),
        reason,
    })
}

/// Notify every migrated object that asked for it, in creation order.
fn notify_hotload(migration: &MigrationContext) -> usize {
    let mut notified = 0;
    for object in migration.objects_implementing(Capability::Hotload) {
        let schema = object.schema();
        let result = catch_unwind(AssertUnwindSafe(|| {
            schema.notify_hotload(&mut *object.write())
        }));
        match result {
            Ok(true) => notified += 1,
            Ok(false) => {}
            Err(panic) => error!(
                "Hot-reload notification of {} panicked: {}",
                schema.name(),
                panic_message(panic.as_ref())
            ),
        }
    }
    notified
}

//! Hot reload integration tests
//!
//! Drives [`HotReloadManager`] through cold starts, migrations and failures
//! using in-process module versions registered against temporary files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graft_kernel::{
    CommandError, CommandRegistry, Handle, HotReloadConfig, ModuleManifest, PluginInfo,
    ReloadEvent, ReloadKind, ReloadPhase, reflect,
};
use graft_plugins::hot_reload::{
    HotReloadManager, LoadError, LoadedModule, ModuleSource, ReloadError, StaticModules,
};
use tempfile::TempDir;

mod v1 {
    use super::*;

    #[derive(Default)]
    pub struct Stats {
        pub total: u64,
        pub owner: Option<Handle<Counter>>,
    }

    reflect!(Stats, |schema| schema
        .value("total", |s: &Stats| &s.total, |s: &mut Stats| &mut s.total)
        .object("owner", |s: &Stats| &s.owner, |s: &mut Stats| &mut s.owner)
        .command("stats.bump", false, |s: &mut Stats, _args: &[String]| s.total += 1)
        .build());

    #[derive(Default)]
    pub struct Settings {
        pub verbose: bool,
    }

    reflect!(Settings, |schema| schema
        .value("verbose", |s: &Settings| &s.verbose, |s: &mut Settings| &mut s.verbose)
        .system()
        .build());

    #[derive(Default)]
    pub struct Counter {
        pub hits: u64,
        pub label: String,
        pub window: Box<[u8]>,
        pub history: Vec<String>,
        pub stats: Option<Handle<Stats>>,
        pub mirror: Option<Handle<Stats>>,
        pub boots: u32,
        pub archive: Box<[Handle<Stats>]>,
        pub settings: Option<Handle<Settings>>,
    }

    reflect!(Counter, |schema| schema
        .entry()
        .value("hits", |c: &Counter| &c.hits, |c: &mut Counter| &mut c.hits)
        .value("label", |c: &Counter| &c.label, |c: &mut Counter| &mut c.label)
        .array("window", |c: &Counter| &c.window, |c: &mut Counter| &mut c.window)
        .list("history", |c: &Counter| &c.history, |c: &mut Counter| &mut c.history)
        .object("stats", |c: &Counter| &c.stats, |c: &mut Counter| &mut c.stats)
        .object("mirror", |c: &Counter| &c.mirror, |c: &mut Counter| &mut c.mirror)
        .value("boots", |c: &Counter| &c.boots, |c: &mut Counter| &mut c.boots)
        .object_array("archive", |c: &Counter| &c.archive)
        .object("settings", |c: &Counter| &c.settings, |c: &mut Counter| &mut c.settings)
        .command("counter.hit", false, |c: &mut Counter, _args: &[String]| c.hits += 1)
        .command("counter.note", false, |c: &mut Counter, args: &[String]| {
            match args.first() {
                Some(note) => {
                    c.history.push(note.clone());
                    true
                }
                None => false,
            }
        })
        .command("counter.reset", true, |c: &mut Counter, _args: &[String]| c.hits = 0)
        .constructor(|c: &mut Counter| {
            c.label = "fresh".to_string();
            c.stats = Some(Handle::new(Stats::default()));
            c.settings = Some(Handle::new(Settings::default()));
            Ok(())
        })
        .startup(|c: &mut Counter| {
            c.boots += 1;
            Ok(())
        })
        .build());

    pub fn manifest() -> ModuleManifest {
        ModuleManifest::new("counter", "1.0.0")
            .with_type::<Counter>()
            .with_type::<Stats>()
            .with_type::<Settings>()
    }
}

mod v2 {
    use super::*;

    #[derive(Default)]
    pub struct Stats {
        pub total: u64,
        pub owner: Option<Handle<Counter>>,
        pub reloads: u32,
    }

    reflect!(Stats, |schema| schema
        .value("total", |s: &Stats| &s.total, |s: &mut Stats| &mut s.total)
        .object("owner", |s: &Stats| &s.owner, |s: &mut Stats| &mut s.owner)
        .value("reloads", |s: &Stats| &s.reloads, |s: &mut Stats| &mut s.reloads)
        .command("stats.bump", false, |s: &mut Stats, _args: &[String]| s.total += 10)
        .on_hotload(|s: &mut Stats| s.reloads += 1)
        .build());

    #[derive(Default)]
    pub struct Counter {
        pub hits: u64,
        pub label: String,
        pub window: Box<[u8]>,
        pub history: Vec<String>,
        pub stats: Option<Handle<Stats>>,
        pub mirror: Option<Handle<Stats>>,
        pub boots: u32,
        pub bonus: u32,
    }

    reflect!(Counter, |schema| schema
        .entry()
        .value("hits", |c: &Counter| &c.hits, |c: &mut Counter| &mut c.hits)
        .value("label", |c: &Counter| &c.label, |c: &mut Counter| &mut c.label)
        .array("window", |c: &Counter| &c.window, |c: &mut Counter| &mut c.window)
        .list("history", |c: &Counter| &c.history, |c: &mut Counter| &mut c.history)
        .object("stats", |c: &Counter| &c.stats, |c: &mut Counter| &mut c.stats)
        .object("mirror", |c: &Counter| &c.mirror, |c: &mut Counter| &mut c.mirror)
        .value("boots", |c: &Counter| &c.boots, |c: &mut Counter| &mut c.boots)
        .value("bonus", |c: &Counter| &c.bonus, |c: &mut Counter| &mut c.bonus)
        .command("counter.hit", false, |c: &mut Counter, _args: &[String]| c.hits += 2)
        .command("counter.reset", true, |c: &mut Counter, _args: &[String]| c.hits = 0)
        .constructor(|c: &mut Counter| {
            c.label = "v2 fresh".to_string();
            Ok(())
        })
        .startup(|c: &mut Counter| {
            c.boots += 100;
            Ok(())
        })
        .on_hotload(|c: &mut Counter| c.bonus = 10)
        .build());

    pub fn manifest() -> ModuleManifest {
        ModuleManifest::new("counter", "2.0.0")
            .with_type::<Counter>()
            .with_type::<Stats>()
    }
}

mod v3 {
    use super::*;

    #[derive(Default)]
    pub struct Stats {
        pub total: u64,
    }

    reflect!(Stats, |schema| schema
        .value("total", |s: &Stats| &s.total, |s: &mut Stats| &mut s.total)
        .build());

    #[derive(Default)]
    pub struct Counter {
        pub archive: Box<[Handle<Stats>]>,
        pub hits: u64,
    }

    reflect!(Counter, |schema| schema
        .entry()
        .object_array("archive", |c: &Counter| &c.archive)
        .value("hits", |c: &Counter| &c.hits, |c: &mut Counter| &mut c.hits)
        .command("counter.hit", false, |c: &mut Counter, _args: &[String]| c.hits += 3)
        .build());

    pub fn manifest() -> ModuleManifest {
        ModuleManifest::new("counter", "3.0.0").with_type::<Counter>()
    }
}

mod tally {
    use super::*;

    #[derive(Default)]
    pub struct Tally {
        pub count: u32,
    }

    reflect!(Tally, |schema| schema
        .entry()
        .value("count", |t: &Tally| &t.count, |t: &mut Tally| &mut t.count)
        .build());

    pub fn manifest() -> ModuleManifest {
        ModuleManifest::new("tally", "1.0.0").with_type::<Tally>()
    }
}

mod faulty {
    use super::*;

    #[derive(Default)]
    pub struct Loose {
        pub value: u32,
    }

    reflect!(Loose, |schema| schema
        .value("value", |l: &Loose| &l.value, |l: &mut Loose| &mut l.value)
        .build());

    #[derive(Default)]
    pub struct First;

    reflect!(First, |schema| schema.entry().build());

    #[derive(Default)]
    pub struct Second;

    reflect!(Second, |schema| schema.entry().build());

    #[derive(Default)]
    pub struct Unconfigured;

    reflect!(Unconfigured, |schema| schema
        .entry()
        .command("unconfigured.run", false, |_u: &mut Unconfigured, _args: &[String]| true)
        .constructor(|_u: &mut Unconfigured| Err(anyhow::anyhow!("missing settings file")))
        .build());

    #[derive(Default)]
    pub struct Crashing;

    reflect!(Crashing, |schema| schema
        .entry()
        .startup(|_c: &mut Crashing| -> anyhow::Result<()> { panic!("startup exploded") })
        .build());

    pub fn no_entry() -> ModuleManifest {
        ModuleManifest::new("loose", "0.1.0").with_type::<Loose>()
    }

    pub fn two_entries() -> ModuleManifest {
        ModuleManifest::new("twins", "0.1.0")
            .with_type::<First>()
            .with_type::<Second>()
    }

    pub fn unconfigured() -> ModuleManifest {
        ModuleManifest::new("unconfigured", "0.1.0").with_type::<Unconfigured>()
    }

    pub fn crashing() -> ModuleManifest {
        ModuleManifest::new("crashing", "0.1.0").with_type::<Crashing>()
    }
}

struct Fixture {
    dir: TempDir,
    registry: Arc<CommandRegistry>,
    modules: Arc<StaticModules>,
    manager: HotReloadManager,
}

impl Fixture {
    fn new(config: HotReloadConfig) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let modules = Arc::new(StaticModules::new());
        let manager =
            HotReloadManager::new(config, registry.clone()).with_source(modules.clone());
        manager.add_plugin(PluginInfo::new("counter")).unwrap();

        Self {
            dir: TempDir::new().unwrap(),
            registry,
            modules,
            manager,
        }
    }

    fn quick() -> Self {
        Self::new(HotReloadConfig::default().with_cleanup_delay(Duration::from_millis(10)))
    }

    /// Write a module file and bind it to `factory`.
    fn module(&self, file: &str, factory: fn() -> ModuleManifest) -> PathBuf {
        let path = self.dir.path().join(file);
        fs::write(&path, file.as_bytes()).unwrap();
        self.modules.register(path.clone(), factory);
        path
    }

    fn symbols(&self, module: &Path) -> PathBuf {
        let path = module.with_extension("pdb");
        fs::write(&path, b"symbols").unwrap();
        path
    }

    fn root<T: graft_kernel::Reflect>(&self) -> Handle<T> {
        let plugin = self.manager.get_plugin("counter").unwrap();
        Handle::from_object(plugin.instance().unwrap()).unwrap()
    }

    fn run(&self, command: &str, args: &[&str]) -> Result<bool, CommandError> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        self.registry.execute(command, &args)
    }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<ReloadEvent>) -> Vec<ReloadEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test]
async fn test_cold_start_constructs_and_registers() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);

    let outcome = fx.manager.reload("counter", &v1).await.unwrap();
    assert_eq!(outcome.kind, ReloadKind::ColdStart);
    assert_eq!(outcome.entry_type, "Counter");
    assert_eq!(outcome.notified, 0);
    assert!(outcome.retirement.is_none());
    assert!(outcome.cleanup.is_none());

    assert_eq!(
        fx.registry.names(),
        ["counter.hit", "counter.note", "counter.reset", "stats.bump"]
    );
    {
        let root = fx.root::<v1::Counter>();
        let state = root.read();
        assert_eq!(state.label, "fresh");
        assert_eq!(state.boots, 1);
        assert!(state.stats.is_some());
    }

    let plugin = fx.manager.get_plugin("counter").unwrap();
    assert_eq!(plugin.phase(), ReloadPhase::Idle);
    assert_eq!(plugin.reload_count(), 1);
    assert_eq!(plugin.module_path(), Some(v1));
    assert_eq!(plugin.instance_type().as_deref(), Some("Counter"));
    assert_eq!(plugin.info().version, "1.0.0");
    assert!(plugin.module_hash().is_some());
}

#[tokio::test]
async fn test_hot_reload_preserves_state() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    for _ in 0..3 {
        assert_eq!(fx.run("counter.hit", &[]), Ok(true));
    }
    assert_eq!(fx.run("counter.note", &["first"]), Ok(true));
    assert_eq!(fx.run("counter.note", &["second"]), Ok(true));
    assert_eq!(fx.run("stats.bump", &[]), Ok(true));

    let old = fx.root::<v1::Counter>();
    {
        let mut state = old.write();
        state.window = vec![1, 2, 3].into_boxed_slice();
        state.mirror = state.stats.clone();
    }

    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    assert_eq!(outcome.kind, ReloadKind::HotReload);
    assert_eq!(outcome.notified, 2);
    assert_eq!(outcome.module_version, "2.0.0");

    let new = fx.root::<v2::Counter>();
    {
        let state = new.read();
        assert_eq!(state.hits, 3);
        assert_eq!(state.label, "fresh");
        assert_eq!(state.boots, 1);
        assert_eq!(state.bonus, 10);
        assert_eq!(&*state.window, &[1, 2, 3]);
        assert_eq!(state.history, ["first", "second"]);

        let stats = state.stats.as_ref().unwrap();
        let mirror = state.mirror.as_ref().unwrap();
        assert!(Handle::ptr_eq(stats, mirror));
        assert_eq!(stats.read().total, 1);
        assert_eq!(stats.read().reloads, 1);
    }

    // Lists move, arrays are copied.
    assert!(old.read().history.is_empty());
    assert_eq!(&*old.read().window, &[1, 2, 3]);

    // Commands now run the new code against the migrated state.
    assert_eq!(fx.run("counter.hit", &[]), Ok(true));
    assert_eq!(new.read().hits, 5);
    assert_eq!(
        fx.run("counter.note", &["x"]),
        Err(CommandError::UnknownCommand("counter.note".into()))
    );

    // The old root is still held here, so its module stays mapped.
    assert!(outcome.retirement.unwrap().leaked);
    assert_eq!(fx.manager.get_plugin("counter").unwrap().info().version, "2.0.0");
}

#[tokio::test]
async fn test_cycles_are_migrated_and_reclaimed() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    {
        let root = fx.root::<v1::Counter>();
        let stats = root.read().stats.clone().unwrap();
        stats.write().owner = Some(root.clone());
    }

    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    let retirement = outcome.retirement.unwrap();
    assert!(!retirement.leaked);
    assert_eq!(retirement.alive, 0);

    let root = fx.root::<v2::Counter>();
    let stats = root.read().stats.clone().unwrap();
    let owner = stats.read().owner.clone().unwrap();
    assert!(Handle::ptr_eq(&owner, &root));

    stats.write().owner = None;
}

#[tokio::test]
async fn test_held_system_object_keeps_old_module_mapped() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();
    let settings = fx.root::<v1::Counter>().read().settings.clone().unwrap();
    let mut events = fx.manager.subscribe();

    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    let retirement = outcome.retirement.unwrap();
    assert!(retirement.leaked);
    assert_eq!(retirement.alive, 1);

    let leaked = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, ReloadEvent::ModuleRetired { leaked: true, .. }));
    assert!(leaked);
    assert!(!settings.read().verbose);
}

#[tokio::test]
async fn test_old_commands_are_gone_while_loading() {
    struct RecordingSource {
        inner: Arc<StaticModules>,
        registry: Arc<CommandRegistry>,
        seen: Mutex<Vec<Result<bool, CommandError>>>,
    }

    impl ModuleSource for RecordingSource {
        fn open(&self, path: &Path) -> Result<LoadedModule, LoadError> {
            let result = self.registry.execute("counter.hit", &[]);
            self.seen.lock().unwrap().push(result);
            self.inner.open(path)
        }
    }

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(CommandRegistry::new());
    let modules = Arc::new(StaticModules::new());
    let v1 = dir.path().join("counter_v1.so");
    let v2 = dir.path().join("counter_v2.so");
    fs::write(&v1, b"v1").unwrap();
    fs::write(&v2, b"v2").unwrap();
    modules.register(v1.clone(), v1::manifest);
    modules.register(v2.clone(), v2::manifest);

    let source = Arc::new(RecordingSource {
        inner: modules,
        registry: registry.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let manager = HotReloadManager::new(HotReloadConfig::default(), registry.clone())
        .with_source(source.clone());
    manager.add_plugin(PluginInfo::new("counter")).unwrap();

    manager.reload("counter", &v1).await.unwrap();
    assert_eq!(registry.execute("counter.hit", &[]), Ok(true));
    manager.reload("counter", &v2).await.unwrap();

    let seen = source.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(
        seen[1],
        Err(CommandError::UnknownCommand("counter.hit".into()))
    );
}

#[tokio::test]
async fn test_unsupported_migration_aborts_without_commands() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    let v3 = fx.module("counter_v3.so", v3::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();
    fx.run("counter.hit", &[]).unwrap();
    fx.run("counter.note", &["kept"]).unwrap();

    let mut events = fx.manager.subscribe();
    let report = fx.manager.reload("counter", &v3).await.unwrap_err();
    match report.current_context() {
        ReloadError::UnsupportedMigration(err) => {
            let message = err.to_string();
            assert!(message.contains("Unsupported state transfer"));
            assert!(message.contains("Counter.archive"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let plugin = fx.manager.get_plugin("counter").unwrap();
    assert_eq!(plugin.phase(), ReloadPhase::Aborted);
    assert_eq!(plugin.module_path(), Some(v1.clone()));
    assert!(fx.registry.is_empty());
    assert!(v1.exists());

    let failed = drain(&mut events).into_iter().any(|event| {
        matches!(
            event,
            ReloadEvent::ReloadFailed {
                phase: ReloadPhase::Migrating,
                ..
            }
        )
    });
    assert!(failed);

    // The old instance survived and the next good reload picks it up.
    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    assert_eq!(outcome.kind, ReloadKind::HotReload);
    let root = fx.root::<v2::Counter>();
    assert_eq!(root.read().hits, 1);
    assert_eq!(root.read().history, ["kept"]);
    assert_eq!(plugin.phase(), ReloadPhase::Idle);
}

#[tokio::test]
async fn test_failed_reload_can_restore_old_commands() {
    let fx = Fixture::new(
        HotReloadConfig::default()
            .with_cleanup_delay(Duration::from_millis(10))
            .with_restore_commands_on_failure(true),
    );
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v3 = fx.module("counter_v3.so", v3::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    let mut events = fx.manager.subscribe();
    fx.manager.reload("counter", &v3).await.unwrap_err();

    assert_eq!(fx.run("counter.hit", &[]), Ok(true));
    assert_eq!(fx.root::<v1::Counter>().read().hits, 1);
    let restored = drain(&mut events).into_iter().find_map(|event| match event {
        ReloadEvent::CommandsRestored { commands, .. } => Some(commands),
        _ => None,
    });
    assert_eq!(restored, Some(4));
}

#[tokio::test]
async fn test_entry_type_must_be_unique() {
    let fx = Fixture::quick();
    let loose = fx.module("loose.so", faulty::no_entry);
    let twins = fx.module("twins.so", faulty::two_entries);

    let report = fx.manager.reload("counter", &loose).await.unwrap_err();
    assert!(matches!(
        report.current_context(),
        ReloadError::Load(LoadError::NoEntryType { module }) if module == "loose"
    ));

    let report = fx.manager.reload("counter", &twins).await.unwrap_err();
    match report.current_context() {
        ReloadError::Load(LoadError::MultipleEntryTypes { module, types }) => {
            assert_eq!(module, "twins");
            assert_eq!(types, &["First", "Second"]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let plugin = fx.manager.get_plugin("counter").unwrap();
    assert!(!plugin.is_loaded());
    assert_eq!(plugin.reload_count(), 0);
}

#[tokio::test]
async fn test_missing_or_unknown_module_files() {
    let fx = Fixture::quick();

    let report = fx
        .manager
        .reload("counter", fx.dir.path().join("absent.so"))
        .await
        .unwrap_err();
    assert!(matches!(
        report.current_context(),
        ReloadError::Load(LoadError::Missing(_))
    ));

    let stray = fx.dir.path().join("stray.so");
    fs::write(&stray, b"stray").unwrap();
    let report = fx.manager.reload("counter", &stray).await.unwrap_err();
    assert!(matches!(
        report.current_context(),
        ReloadError::Load(LoadError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_construction_failures_leave_plugin_empty() {
    let fx = Fixture::quick();
    let unconfigured = fx.module("unconfigured.so", faulty::unconfigured);
    let crashing = fx.module("crashing.so", faulty::crashing);

    let report = fx.manager.reload("counter", &unconfigured).await.unwrap_err();
    match report.current_context() {
        ReloadError::Construction { type_name, reason } => {
            assert_eq!(type_name, "Unconfigured");
            assert!(reason.contains("missing settings file"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(fx.registry.is_empty());

    let report = fx.manager.reload("counter", &crashing).await.unwrap_err();
    match report.current_context() {
        ReloadError::Construction { reason, .. } => assert!(reason.contains("startup exploded")),
        other => panic!("unexpected error {other:?}"),
    }

    let plugin = fx.manager.get_plugin("counter").unwrap();
    assert!(!plugin.is_loaded());
    assert_eq!(plugin.phase(), ReloadPhase::Aborted);
}

#[tokio::test]
async fn test_old_module_files_are_removed_later() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v1_symbols = fx.symbols(&v1);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    let v2_symbols = fx.symbols(&v2);
    fx.manager.reload("counter", &v1).await.unwrap();

    let mut outcome = fx.manager.reload("counter", &v2).await.unwrap();
    // Deletion is deferred past the reload itself.
    assert!(v1.exists());

    let report = outcome.wait_for_cleanup().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.removed.len(), 2);
    assert!(!v1.exists());
    assert!(!v1_symbols.exists());
    assert!(v2.exists());
    assert!(v2_symbols.exists());
}

#[tokio::test]
async fn test_module_file_shared_by_plugins_is_kept() {
    let fx = Fixture::quick();
    fx.manager.add_plugin(PluginInfo::new("one")).unwrap();
    fx.manager.add_plugin(PluginInfo::new("two")).unwrap();
    let shared = fx.module("shared.so", tally::manifest);
    let next = fx.module("next.so", tally::manifest);
    fx.manager.reload("one", &shared).await.unwrap();
    fx.manager.reload("two", &shared).await.unwrap();

    let mut outcome = fx.manager.reload("one", &next).await.unwrap();
    assert_eq!(outcome.kind, ReloadKind::HotReload);
    assert!(outcome.wait_for_cleanup().await.is_none());
    assert!(shared.exists());
    assert_eq!(
        fx.manager.get_plugin("two").unwrap().module_path(),
        Some(shared.clone())
    );

    // The file goes once its last plugin moves on.
    let mut outcome = fx.manager.reload("two", &next).await.unwrap();
    let report = outcome.wait_for_cleanup().await.unwrap();
    assert!(report.is_clean());
    assert!(!shared.exists());
    assert!(next.exists());
}

#[tokio::test]
async fn test_locked_symbols_warn_and_are_retried() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let locked = v1.with_extension("pdb");
    fs::create_dir(&locked).unwrap();
    let v2 = fx.module("counter_v2.so", v2::manifest);
    let v2b = fx.module("counter_v2b.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    let mut events = fx.manager.subscribe();
    let mut outcome = fx.manager.reload("counter", &v2).await.unwrap();
    let report = outcome.wait_for_cleanup().await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].path, locked);
    assert!(!v1.exists());
    assert_eq!(fx.manager.stale_artifacts().len(), 1);

    let warned = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, ReloadEvent::CleanupWarning { .. }));
    assert!(warned);

    // Unlock and reload again: the leftover goes with the next cleanup.
    fs::remove_dir(&locked).unwrap();
    fs::write(&locked, b"symbols").unwrap();
    let mut outcome = fx.manager.reload("counter", &v2b).await.unwrap();
    let report = outcome.wait_for_cleanup().await.unwrap();
    assert!(report.is_clean());
    assert!(!locked.exists());
    assert!(!v2.exists());
    assert!(fx.manager.stale_artifacts().is_empty());
}

#[tokio::test]
async fn test_reload_in_place_keeps_the_file() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();
    fx.run("counter.hit", &[]).unwrap();
    let mut outcome = fx.manager.reload("counter", &v2).await.unwrap();
    outcome.wait_for_cleanup().await.unwrap();

    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    assert_eq!(outcome.kind, ReloadKind::HotReload);
    assert!(outcome.cleanup.is_none());
    assert!(v2.exists());
    assert_eq!(fx.root::<v2::Counter>().read().hits, 1);
}

#[tokio::test]
async fn test_keeping_old_files_is_configurable() {
    let fx = Fixture::new(HotReloadConfig::default().with_remove_old_modules(false));
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    let outcome = fx.manager.reload("counter", &v2).await.unwrap();
    assert!(outcome.cleanup.is_none());
    assert!(v1.exists());
}

#[tokio::test]
async fn test_phase_events_follow_the_reload() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    let mut events = fx.manager.subscribe();

    fx.manager.reload("counter", &v1).await.unwrap();
    let cold = drain(&mut events);
    assert!(matches!(cold.first(), Some(ReloadEvent::ReloadStarted { .. })));
    let phases: Vec<_> = cold
        .iter()
        .filter_map(|event| match event {
            ReloadEvent::PhaseChanged { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        [
            ReloadPhase::Loading,
            ReloadPhase::ColdStart,
            ReloadPhase::Registering,
            ReloadPhase::Finalizing,
            ReloadPhase::Idle,
        ]
    );
    match cold.last() {
        Some(ReloadEvent::ReloadCompleted { kind, commands, .. }) => {
            assert_eq!(*kind, ReloadKind::ColdStart);
            assert_eq!(*commands, 4);
        }
        other => panic!("unexpected event {other:?}"),
    }

    fx.manager.reload("counter", &v2).await.unwrap();
    let hot = drain(&mut events);
    let phases: Vec<_> = hot
        .iter()
        .filter_map(|event| match event {
            ReloadEvent::PhaseChanged { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        [
            ReloadPhase::Unregistering,
            ReloadPhase::Loading,
            ReloadPhase::Migrating,
            ReloadPhase::Registering,
            ReloadPhase::Notifying,
            ReloadPhase::Finalizing,
            ReloadPhase::Idle,
        ]
    );
    assert!(hot.iter().all(|event| event.plugin() == "counter"));
    assert!(hot.iter().any(|event| matches!(
        event,
        ReloadEvent::ModuleRetired { path, leaked: false, .. } if *path == v1
    )));
}

#[tokio::test]
async fn test_debug_only_flag_survives_reload() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();
    fx.manager.reload("counter", &v2).await.unwrap();

    assert_eq!(
        fx.run("counter.reset", &[]),
        Err(CommandError::RequiresDebuggee("counter.reset".into()))
    );
    fx.registry.set_debuggee_active(true);
    fx.run("counter.hit", &[]).unwrap();
    assert_eq!(fx.run("counter.reset", &[]), Ok(true));
    assert_eq!(fx.root::<v2::Counter>().read().hits, 0);
}

#[tokio::test]
async fn test_concurrent_reloads_are_serialized() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    let v2 = fx.module("counter_v2.so", v2::manifest);

    let (first, second) = tokio::join!(
        fx.manager.reload("counter", &v1),
        fx.manager.reload("counter", &v2)
    );
    let kinds = [first.unwrap().kind, second.unwrap().kind];
    assert!(kinds.contains(&ReloadKind::ColdStart));
    assert!(kinds.contains(&ReloadKind::HotReload));
    assert_eq!(fx.manager.get_plugin("counter").unwrap().reload_count(), 2);
}

#[tokio::test]
async fn test_unload_plugin_releases_everything() {
    let fx = Fixture::quick();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();
    let mut events = fx.manager.subscribe();

    fx.manager.unload_plugin("counter").await.unwrap();
    assert!(fx.registry.is_empty());
    assert!(fx.manager.get_plugin("counter").is_none());
    assert!(v1.exists());

    let retired = drain(&mut events).into_iter().any(|event| {
        matches!(event, ReloadEvent::ModuleRetired { leaked: false, .. })
    });
    assert!(retired);

    let report = fx.manager.unload_plugin("counter").await.unwrap_err();
    assert!(matches!(
        report.current_context(),
        ReloadError::PluginNotFound(_)
    ));
}

#[tokio::test]
async fn test_shutdown_unloads_all_plugins() {
    let fx = Fixture::quick();
    fx.manager.add_plugin(PluginInfo::new("idle")).unwrap();
    let v1 = fx.module("counter_v1.so", v1::manifest);
    fx.manager.reload("counter", &v1).await.unwrap();

    fx.manager.shutdown().await;
    assert!(fx.manager.list_plugins().is_empty());
    assert!(fx.registry.is_empty());
}

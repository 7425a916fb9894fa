//! Retirement of replaced modules
//!
//! A replaced module is unmapped only once no object created from it is
//! alive. Its files are deleted later, from a background task.

use super::loader::IsolatedContext;
use graft_kernel::object::WeakObjectRef;
use graft_kernel::{FieldValue, ReloadEvent};
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kind of file left behind by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Module,
    DebugSymbols,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Module => f.write_str("module"),
            ArtifactKind::DebugSymbols => f.write_str("debug symbols"),
        }
    }
}

/// A file scheduled for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn module(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::Module,
        }
    }

    pub fn debug_symbols(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ArtifactKind::DebugSymbols,
        }
    }

    /// The module file and its companion symbol file.
    pub fn pair(module: &Path, symbol_extension: &str) -> [Self; 2] {
        [
            Self::module(module),
            Self::debug_symbols(debug_symbol_path(module, symbol_extension)),
        ]
    }
}

/// A module file that could not be deleted. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unable to remove old {kind} {path:?}: {reason}")]
pub struct FileCleanupWarning {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub reason: String,
}

/// Outcome of one deferred cleanup.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<FileCleanupWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Files that failed to delete, retried after the next successful reload.
pub type StaleArtifacts = Arc<Mutex<Vec<Artifact>>>;

/// Companion debug-symbol path: the module path with its extension swapped.
pub fn debug_symbol_path(module: &Path, extension: &str) -> PathBuf {
    module.with_extension(extension.trim_start_matches('.'))
}

/// Delete one artifact. A file that is already gone counts as not removed.
pub fn remove_artifact(artifact: &Artifact) -> Result<bool, FileCleanupWarning> {
    match std::fs::remove_file(&artifact.path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileCleanupWarning {
            path: artifact.path.clone(),
            kind: artifact.kind,
            reason: err.to_string(),
        }),
    }
}

/// Wait for the old objects to be released.
///
/// On the first pass still-alive objects get their reference fields cleared,
/// so cycles inside the old graph cannot keep it alive. Returns the number of
/// objects alive after the last pass.
pub async fn reclaim(objects: &[WeakObjectRef], passes: u32) -> usize {
    let mut alive = count_alive(objects);
    for pass in 0..passes.max(1) {
        if alive == 0 {
            break;
        }
        if pass == 0 {
            sever_references(objects);
        }
        tokio::task::yield_now().await;
        alive = count_alive(objects);
        debug!("Reclaim pass {}: {} old objects alive", pass + 1, alive);
    }
    alive
}

fn count_alive(objects: &[WeakObjectRef]) -> usize {
    objects.iter().filter(|object| object.strong_count() > 0).count()
}

fn sever_references(objects: &[WeakObjectRef]) {
    for object in objects.iter().filter_map(|object| object.upgrade()) {
        let schema = object.schema();
        let mut state = object.write();
        for field in schema.fields().iter().filter(|field| field.kind().is_object()) {
            if let Err(err) = field.set(&mut *state, FieldValue::Object(None)) {
                debug!("Cannot clear {}.{}: {}", schema.name(), field.name(), err);
            }
        }
    }
}

/// How a context was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retirement {
    /// Old objects still alive after reclaiming
    pub alive: usize,
    /// The library stays mapped because objects are still alive
    pub leaked: bool,
}

/// Unload `context` once its objects are gone, or leak it if they never go.
///
/// `objects` are released before unloading: their vtables live in the module.
pub async fn retire_context(
    mut context: IsolatedContext,
    objects: Vec<WeakObjectRef>,
    passes: u32,
) -> Retirement {
    let alive = reclaim(&objects, passes).await;
    drop(objects);
    if alive == 0 {
        context.unload_current();
        Retirement {
            alive,
            leaked: false,
        }
    } else {
        warn!(
            "{} old objects still referenced after {} passes, keeping context {} mapped; ensure no references are stored",
            alive,
            passes,
            context.id()
        );
        context.leak_current();
        Retirement { alive, leaked: true }
    }
}

/// Delete `artifacts` after `delay` on a background task.
///
/// Failures are logged, broadcast as [`ReloadEvent::CleanupWarning`] and
/// remembered in `stale` for a later retry.
pub fn schedule_cleanup(
    plugin: String,
    artifacts: Vec<Artifact>,
    delay: Duration,
    stale: StaleArtifacts,
    event_tx: broadcast::Sender<ReloadEvent>,
) -> JoinHandle<CleanupReport> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let mut report = CleanupReport::default();
        for artifact in artifacts {
            match remove_artifact(&artifact) {
                Ok(true) => {
                    info!("Removed old {} {:?}", artifact.kind, artifact.path);
                    report.removed.push(artifact.path);
                }
                Ok(false) => debug!("Old {} {:?} already gone", artifact.kind, artifact.path),
                Err(warning) => {
                    warn!("{}, will retry after the next reload", warning);
                    let _ = event_tx.send(ReloadEvent::CleanupWarning {
                        plugin: plugin.clone(),
                        path: warning.path.clone(),
                        reason: warning.reason.clone(),
                    });
                    {
                        let mut stale = stale.lock();
                        if !stale.contains(&artifact) {
                            stale.push(artifact);
                        }
                    }
                    report.warnings.push(warning);
                }
            }
        }
        report
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_kernel::{Handle, reflect};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Link {
        next: Option<Handle<Link>>,
    }

    reflect!(Link, |schema| schema
        .object("next", |l: &Link| &l.next, |l: &mut Link| &mut l.next)
        .build());

    #[test]
    fn test_debug_symbol_path() {
        assert_eq!(
            debug_symbol_path(Path::new("/p/counter.dll"), "pdb"),
            PathBuf::from("/p/counter.pdb")
        );
        assert_eq!(
            debug_symbol_path(Path::new("/p/libcounter.so"), ".debug"),
            PathBuf::from("/p/libcounter.debug")
        );
    }

    #[test]
    fn test_remove_artifact() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("old.so");
        fs::write(&file, b"x").unwrap();

        assert_eq!(remove_artifact(&Artifact::module(&file)), Ok(true));
        assert_eq!(remove_artifact(&Artifact::module(&file)), Ok(false));

        let locked = dir.path().join("old.pdb");
        fs::create_dir(&locked).unwrap();
        let warning = remove_artifact(&Artifact::debug_symbols(&locked)).unwrap_err();
        assert_eq!(warning.kind, ArtifactKind::DebugSymbols);
        assert!(warning.to_string().contains("debug symbols"));
    }

    #[tokio::test]
    async fn test_reclaim_breaks_cycles() {
        let a = Handle::new(Link::default());
        let b = Handle::new(Link {
            next: Some(a.clone()),
        });
        a.write().next = Some(b.clone());
        let objects = vec![
            Arc::downgrade(&a.to_object()),
            Arc::downgrade(&b.to_object()),
        ];
        drop(a);
        drop(b);

        assert_eq!(count_alive(&objects), 2);
        assert_eq!(reclaim(&objects, 5).await, 0);
    }

    #[tokio::test]
    async fn test_reclaim_reports_pinned_objects() {
        let pinned = Handle::new(Link::default());
        let objects = vec![Arc::downgrade(&pinned.to_object())];
        assert_eq!(reclaim(&objects, 3).await, 1);
    }

    #[tokio::test]
    async fn test_schedule_cleanup_removes_and_warns() {
        let dir = TempDir::new().unwrap();
        let module = dir.path().join("v1.so");
        fs::write(&module, b"x").unwrap();
        let symbols = dir.path().join("v1.pdb");
        fs::create_dir(&symbols).unwrap();

        let stale: StaleArtifacts = Arc::default();
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let handle = schedule_cleanup(
            "counter".into(),
            Artifact::pair(&module, "pdb").to_vec(),
            Duration::from_millis(5),
            stale.clone(),
            event_tx,
        );

        let report = handle.await.unwrap();
        assert_eq!(report.removed, [module.clone()]);
        assert_eq!(report.warnings.len(), 1);
        assert!(!module.exists());
        assert_eq!(stale.lock().as_slice(), [Artifact::debug_symbols(&symbols)]);

        match event_rx.recv().await.unwrap() {
            ReloadEvent::CleanupWarning { plugin, path, .. } => {
                assert_eq!(plugin, "counter");
                assert_eq!(path, symbols);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

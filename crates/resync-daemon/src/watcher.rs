//! Filesystem watch service.
//!
//! Keeps one non-recursive notify watch per directory under every watched
//! root and translates raw notifications into `RepositoryEvent`s carrying a
//! snapshot of the affected entry. Translation runs on a dedicated thread,
//! `resync-watch`, which also registers directories as they appear.
//!
//! Event mapping:
//! - `Create` and rename-to: CREATED
//! - content or metadata changes: MODIFIED
//! - `Remove` and rename-from: DELETED
//! - access events and rescans: ignored

use crate::snapshot;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use resync_core::events::{RepositoryEvent, RepositoryEventBus, RepositoryEventKind};
use resync_core::project::ProjectRegistry;
use resync_core::resource::ResourceType;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Failed to start watch thread: {0}")]
    Thread(#[source] std::io::Error),
}

enum LoopInput {
    Notify(notify::Result<Event>),
    Shutdown,
}

/// Watch registrations, guarded by a single mutex shared with the loop.
///
/// notify identifies a watch by its path, so the path map is the whole
/// handle table. Each directory maps to the epoch it was registered in.
struct Registrations {
    watcher: RecommendedWatcher,
    dirs: BTreeMap<PathBuf, u64>,
    next_epoch: u64,
    /// Paths passed to `watch`. A directory stays registered while any root covers it.
    roots: BTreeSet<PathBuf>,
    /// Directories retired on deletion whose second notice (self or parent)
    /// has not arrived yet.
    retired: HashSet<PathBuf>,
    /// Entries published by a directory walk; their own CREATED notice is dropped.
    announced: HashSet<PathBuf>,
}

/// What a subtree walk registered and found.
#[derive(Default)]
struct Walk {
    registered: Vec<PathBuf>,
    /// Entries found inside newly registered directories.
    discovered: Vec<PathBuf>,
}

impl Registrations {
    fn new(watcher: RecommendedWatcher) -> Self {
        Self {
            watcher,
            dirs: BTreeMap::new(),
            next_epoch: 0,
            roots: BTreeSet::new(),
            retired: HashSet::new(),
            announced: HashSet::new(),
        }
    }

    /// Register `root` and every directory below it that is not registered yet.
    ///
    /// On error, `walk` holds what was registered before the failure.
    fn register_tree(&mut self, root: &Path, walk: &mut Walk) -> Result<(), WatchError> {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let fresh = !self.dirs.contains_key(&dir);
            if fresh {
                self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
                self.retired.remove(&dir);
                self.next_epoch += 1;
                self.dirs.insert(dir.clone(), self.next_epoch);
                walk.registered.push(dir.clone());
            }

            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Cannot list {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if fresh {
                    walk.discovered.push(path.clone());
                }
                // Symlinked directories are not followed.
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(path);
                }
            }
        }
        Ok(())
    }

    /// Registered directories at or under `root`.
    fn subtree(&self, root: &Path) -> Vec<PathBuf> {
        // Descendants sort right after their ancestor.
        self.dirs
            .range(root.to_path_buf()..)
            .map(|(dir, _)| dir)
            .take_while(|dir| dir.starts_with(root))
            .cloned()
            .collect()
    }

    fn unregister(&mut self, dirs: &[PathBuf]) -> usize {
        for dir in dirs {
            // Fails when the directory is already gone; the OS dropped the watch then.
            if let Err(e) = self.watcher.unwatch(dir) {
                trace!("Unwatch {}: {}", dir.display(), e);
            }
            self.dirs.remove(dir);
        }
        dirs.len()
    }

    /// Forget pending notices at or under `root`, except below `keep`.
    fn prune(&mut self, root: &Path, keep: &[PathBuf]) {
        let stale = |p: &PathBuf| p.starts_with(root) && !keep.iter().any(|k| p.starts_with(k));
        self.retired.retain(|p| !stale(p));
        self.announced.retain(|p| !stale(p));
    }

    /// Cancel and forget every registration at or under a deleted `root`.
    fn retire_tree(&mut self, root: &Path) -> usize {
        let doomed = self.subtree(root);
        self.prune(root, &[]);
        self.unregister(&doomed)
    }

    /// Stop watching `path` on behalf of its caller.
    ///
    /// When `path` was a root, directories another root still covers stay
    /// registered: nothing if an enclosing root remains, otherwise everything
    /// except the subtrees of nested roots.
    fn release(&mut self, path: &Path) -> usize {
        if self.roots.remove(path) && self.roots.iter().any(|r| path.starts_with(r)) {
            return 0;
        }
        let nested: Vec<PathBuf> = self
            .roots
            .range(path.to_path_buf()..)
            .take_while(|r| r.starts_with(path))
            .cloned()
            .collect();
        let doomed: Vec<PathBuf> = self
            .subtree(path)
            .into_iter()
            .filter(|dir| !nested.iter().any(|r| dir.starts_with(r)))
            .collect();
        self.prune(path, &nested);
        self.unregister(&doomed)
    }
}

/// An event staged under the registration lock.
struct Staged {
    kind: RepositoryEventKind,
    path: PathBuf,
    /// The parent registration the event was observed through.
    parent: PathBuf,
    epoch: u64,
}

struct Shared {
    projects: Arc<ProjectRegistry>,
    bus: Arc<RepositoryEventBus>,
    registrations: Mutex<Registrations>,
    /// Held while an event is handed to listeners.
    delivery: Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, event: Event) {
        if event.need_rescan() {
            warn!("Watcher dropped notifications (rescan requested), continuing");
            return;
        }
        for path in &event.paths {
            if let Some(kind) = classify(&event.kind, path) {
                self.process(kind, path);
            }
        }
    }

    /// Translate one notification for `path` and publish it.
    ///
    /// Bookkeeping happens under the registration lock. Snapshots are read and
    /// listeners called without it, and an event is only delivered while the
    /// parent registration it was staged under is still live, so `retire`
    /// cancels synchronously.
    fn process(&self, kind: RepositoryEventKind, path: &Path) {
        let staged = self.stage(kind, path);
        for entry in staged {
            if let Some(event) = self.snapshot(entry.kind, &entry.path) {
                self.deliver(&entry, &event);
            }
        }
    }

    fn stage(&self, kind: RepositoryEventKind, path: &Path) -> Vec<Staged> {
        let mut regs = self.lock();

        match kind {
            RepositoryEventKind::Created => {
                // A path created anew has no deletion notice pending.
                regs.retired.remove(path);
                if regs.announced.remove(path) {
                    trace!("{} was already announced", path.display());
                    return Vec::new();
                }
            }
            RepositoryEventKind::Modified => {
                regs.announced.remove(path);
            }
            RepositoryEventKind::Deleted => {
                regs.announced.remove(path);
                if regs.dirs.contains_key(path) {
                    let count = regs.retire_tree(path);
                    regs.retired.insert(path.to_path_buf());
                    trace!("Retired {} watch(es) under {}", count, path.display());
                } else if regs.retired.remove(path) {
                    trace!("Second deletion notice for {}", path.display());
                    return Vec::new();
                }
            }
        }

        let Some(parent) = path.parent() else {
            return Vec::new();
        };
        let Some(&epoch) = regs.dirs.get(parent) else {
            trace!("Dropping {} for unwatched {}", kind, path.display());
            return Vec::new();
        };
        let mut staged = vec![Staged {
            kind,
            path: path.to_path_buf(),
            parent: parent.to_path_buf(),
            epoch,
        }];

        if kind == RepositoryEventKind::Created && path.is_dir() {
            let mut walk = Walk::default();
            if let Err(e) = regs.register_tree(path, &mut walk) {
                warn!("Failed to watch new directory {}: {}", path.display(), e);
            }
            for entry in walk.discovered {
                let Some(parent) = entry.parent() else {
                    continue;
                };
                let Some(&epoch) = regs.dirs.get(parent) else {
                    continue;
                };
                regs.announced.insert(entry.clone());
                staged.push(Staged {
                    kind: RepositoryEventKind::Created,
                    parent: parent.to_path_buf(),
                    epoch,
                    path: entry,
                });
            }
        }
        staged
    }

    fn snapshot(&self, kind: RepositoryEventKind, path: &Path) -> Option<RepositoryEvent> {
        let Some(resolved) = self.projects.resolve(path) else {
            trace!("{} is outside every project", path.display());
            return None;
        };
        if resolved.relative.is_empty() {
            return None;
        }

        let resource = match snapshot::read_blocking(&resolved.project_id, &resolved.relative, path)
        {
            Ok(resource) => resource,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        if kind == RepositoryEventKind::Modified && resource.resource_type() == ResourceType::Unknown {
            debug!("{} vanished before it could be read", path.display());
            return None;
        }
        Some(RepositoryEvent::new(kind, resource))
    }

    fn deliver(&self, staged: &Staged, event: &RepositoryEvent) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if self.lock().dirs.get(&staged.parent) != Some(&staged.epoch) {
            trace!("Dropping {} for retired {}", staged.kind, staged.path.display());
            return;
        }
        debug!("{} {}", event.kind(), event.resource());
        self.bus.publish(event);
    }
}

/// Map a raw notification kind to a repository event kind.
fn classify(kind: &EventKind, path: &Path) -> Option<RepositoryEventKind> {
    match kind {
        EventKind::Create(_) => Some(RepositoryEventKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RepositoryEventKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RepositoryEventKind::Created),
        // Both halves are also delivered individually.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                Some(RepositoryEventKind::Created)
            } else {
                Some(RepositoryEventKind::Deleted)
            }
        }
        EventKind::Modify(_) => Some(RepositoryEventKind::Modified),
        EventKind::Remove(_) => Some(RepositoryEventKind::Deleted),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

fn check_directory(path: &Path) -> Result<(), WatchError> {
    if !path.is_absolute() {
        return Err(WatchError::InvalidArgument(format!(
            "watch path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(WatchError::InvalidArgument(format!(
            "watch path is not an existing directory: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Recursive directory watcher publishing on a `RepositoryEventBus`.
///
/// Listeners run on the watch thread and may call back into the service,
/// including `unwatch`. Dropping the service stops the monitoring thread and
/// all watches.
pub struct WatchService {
    shared: Arc<Shared>,
    control: mpsc::Sender<LoopInput>,
    thread: Option<JoinHandle<()>>,
}

impl WatchService {
    /// Create the native watcher and start the monitoring thread.
    pub fn start(
        projects: Arc<ProjectRegistry>,
        bus: Arc<RepositoryEventBus>,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel();
        let notify_tx = tx.clone();
        let watcher = notify::recommended_watcher(move |result| {
            // Receiver is gone only after shutdown.
            let _ = notify_tx.send(LoopInput::Notify(result));
        })?;

        let shared = Arc::new(Shared {
            projects,
            bus,
            registrations: Mutex::new(Registrations::new(watcher)),
            delivery: Mutex::new(()),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("resync-watch".to_string())
            .spawn(move || run_loop(loop_shared, rx))
            .map_err(WatchError::Thread)?;

        Ok(Self {
            shared,
            control: tx,
            thread: Some(thread),
        })
    }

    /// Watch `path` and every directory below it. Returns how many were newly registered.
    pub fn watch(&self, path: &Path) -> Result<usize, WatchError> {
        check_directory(path)?;
        let mut regs = self.shared.lock();
        let mut walk = Walk::default();
        if let Err(e) = regs.register_tree(path, &mut walk) {
            regs.unregister(&walk.registered);
            return Err(e);
        }
        regs.roots.insert(path.to_path_buf());
        debug!(
            "Watching {} ({} new directories)",
            path.display(),
            walk.registered.len()
        );
        Ok(walk.registered.len())
    }

    /// Stop watching `path` and everything below it that no other watched
    /// root covers. Returns how many watches were retired.
    ///
    /// No event for a retired directory is published once this returns.
    pub fn unwatch(&self, path: &Path) -> Result<usize, WatchError> {
        check_directory(path)?;
        Ok(self.retire(path))
    }

    /// Like `unwatch`, without checking that `path` still exists.
    pub fn retire(&self, path: &Path) -> usize {
        let count = self.shared.lock().release(path);
        // Wait out a delivery in flight, unless this is a listener inside it.
        if !self.on_watch_thread() {
            drop(self.shared.delivery.lock().unwrap_or_else(|e| e.into_inner()));
        }
        debug!("Unwatched {} ({} directories)", path.display(), count);
        count
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.shared.lock().dirs.contains_key(path)
    }

    pub fn watched_count(&self) -> usize {
        self.shared.lock().dirs.len()
    }

    fn on_watch_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.thread().id() == std::thread::current().id())
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        let _ = self.control.send(LoopInput::Shutdown);
        // A listener may drop the last handle from inside the loop.
        let on_watch_thread = self.on_watch_thread();
        if let Some(thread) = self.thread.take() {
            if !on_watch_thread {
                let _ = thread.join();
            }
        }
    }
}

fn run_loop(shared: Arc<Shared>, rx: mpsc::Receiver<LoopInput>) {
    debug!("Watch loop started");
    while let Ok(input) = rx.recv() {
        match input {
            LoopInput::Notify(Ok(event)) => shared.handle(event),
            LoopInput::Notify(Err(e)) => error!("File watcher error: {}", e),
            LoopInput::Shutdown => break,
        }
    }
    debug!("Watch loop stopped");
}

//! Polling file watcher for the knowledge-base folder.
//!
//! The watcher keeps a snapshot of `relative path → SHA-256 of contents` for
//! every allowed file under its root. Each poll rescans the tree, diffs the
//! result against the last known snapshot, and reports the difference to a
//! [`WatchHandler`] before adopting the new snapshot.
//!
//! There is no rename detection: a move shows up as a delete plus a create.
//! Files that cannot be read are left out of the snapshot entirely.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::KnowledgeBaseConfig;
use crate::store::lock;

/// Relative path (with `/` separators) to hex content hash.
pub type Snapshot = HashMap<String, String>;

/// How long `stop` waits past one poll interval for the thread to exit.
const STOP_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Paths that changed between two snapshots, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Compare `current` against `known`.
pub fn diff_snapshots(known: &Snapshot, current: &Snapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, hash) in current {
        match known.get(path) {
            None => changes.created.push(path.clone()),
            Some(old) if old != hash => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    changes.deleted = known
        .keys()
        .filter(|path| !current.contains_key(*path))
        .cloned()
        .collect();
    changes.created.sort();
    changes.modified.sort();
    changes.deleted.sort();
    changes
}

/// Receives change notifications from the poll loop. Errors are logged by
/// the watcher and never stop it.
pub trait WatchHandler: Send + Sync {
    fn on_created(&self, rel_path: &str) -> Result<()>;
    fn on_modified(&self, rel_path: &str) -> Result<()>;
    fn on_deleted(&self, rel_path: &str) -> Result<()>;
}

/// Hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// The part of the watcher shared with the poll thread.
struct Scanner {
    root: PathBuf,
    extensions: HashSet<String>,
    excludes: GlobSet,
}

impl Scanner {
    fn allowed(&self, rel: &str, path: &Path) -> bool {
        if self.excludes.is_match(rel) {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn scan(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel = relative.to_string_lossy().replace('\\', "/");
            if !self.allowed(&rel, path) {
                continue;
            }
            match hash_file(path) {
                Ok(hash) => {
                    snapshot.insert(rel, hash);
                }
                Err(e) => debug!(path = %rel, error = %e, "skipping unreadable file"),
            }
        }
        snapshot
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct FileWatcher {
    scanner: Arc<Scanner>,
    interval: Duration,
    known: Arc<Mutex<Snapshot>>,
    worker: Mutex<Option<Worker>>,
}

impl FileWatcher {
    /// Watch `root` for files whose extension (without the dot) is in
    /// `extensions`. `exclude_globs` are matched against relative paths in
    /// addition to the built-in VCS and build-output excludes.
    pub fn new(
        root: impl Into<PathBuf>,
        interval: Duration,
        extensions: &[String],
        exclude_globs: &[String],
    ) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            scanner: Arc::new(Scanner {
                root: root.into(),
                extensions: extensions
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                    .collect(),
                excludes: build_globset(&excludes)?,
            }),
            interval,
            known: Arc::new(Mutex::new(Snapshot::new())),
            worker: Mutex::new(None),
        })
    }

    pub fn from_config(config: &KnowledgeBaseConfig) -> Result<Self> {
        Self::new(
            &config.root,
            Duration::from_secs_f64(config.poll_interval_secs),
            &config.extensions,
            &config.exclude_globs,
        )
    }

    pub fn root(&self) -> &Path {
        &self.scanner.root
    }

    /// Hash every allowed file under the root.
    pub fn scan(&self) -> Snapshot {
        self.scanner.scan()
    }

    /// Changes between the known snapshot and `current`.
    pub fn diff(&self, current: &Snapshot) -> ChangeSet {
        diff_snapshots(&lock(&self.known), current)
    }

    /// Scan and adopt the result as the known baseline.
    pub fn snapshot(&self) -> Snapshot {
        let current = self.scan();
        *lock(&self.known) = current.clone();
        current
    }

    /// Replace the known baseline, e.g. with a manifest's hashes.
    pub fn set_known(&self, known: Snapshot) {
        *lock(&self.known) = known;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the background poll loop. No-op if already running.
    pub fn start(&self, handler: Arc<dyn WatchHandler>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if let Some(w) = worker.as_ref() {
            if !w.handle.is_finished() {
                return Ok(());
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let scanner = Arc::clone(&self.scanner);
        let known = Arc::clone(&self.known);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("kb-watcher".to_string())
            .spawn(move || loop {
                poll_once(&scanner, &known, handler.as_ref());
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        info!(
            root = %self.scanner.root.display(),
            interval_ms = interval.as_millis() as u64,
            "file watcher started"
        );
        Ok(())
    }

    /// Stop the poll loop and wait for it to exit. No-op if not running.
    ///
    /// Waits at most one interval plus a short grace period; a thread still
    /// busy after that is detached.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        let _ = worker.stop.send(());
        let deadline = Instant::now() + self.interval + STOP_GRACE;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                error!("file watcher thread panicked");
            }
            info!(root = %self.scanner.root.display(), "file watcher stopped");
        } else {
            warn!(
                root = %self.scanner.root.display(),
                "file watcher did not stop in time, detaching"
            );
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_once(scanner: &Scanner, known: &Mutex<Snapshot>, handler: &dyn WatchHandler) {
    let current = scanner.scan();
    let changes = diff_snapshots(&lock(known), &current);
    if !changes.is_empty() {
        info!(
            created = changes.created.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "file changes detected"
        );
    }

    for path in &changes.created {
        dispatch("created", path, || handler.on_created(path));
    }
    for path in &changes.modified {
        dispatch("modified", path, || handler.on_modified(path));
    }
    for path in &changes.deleted {
        dispatch("deleted", path, || handler.on_deleted(path));
    }

    *lock(known) = current;
}

fn dispatch<F>(event: &str, path: &str, call: F)
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event, path, error = %e, "change handler failed"),
        Err(_) => error!(event, path, "change handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        vec!["txt".into(), "md".into()]
    }

    fn watcher(root: &Path, interval: Duration) -> FileWatcher {
        FileWatcher::new(root, interval, &exts(), &["**/drafts/**".to_string()]).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl WatchHandler for Recorder {
        fn on_created(&self, rel_path: &str) -> Result<()> {
            lock(&self.events).push(format!("created:{}", rel_path));
            Ok(())
        }
        fn on_modified(&self, rel_path: &str) -> Result<()> {
            lock(&self.events).push(format!("modified:{}", rel_path));
            anyhow::bail!("handler failure must not stop the loop")
        }
        fn on_deleted(&self, rel_path: &str) -> Result<()> {
            lock(&self.events).push(format!("deleted:{}", rel_path));
            Ok(())
        }
    }

    #[test]
    fn test_scan_filters_extensions_and_excludes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("b.MD"), "b").unwrap();
        fs::write(tmp.path().join("c.bin"), "c").unwrap();
        fs::create_dir_all(tmp.path().join("sub/drafts")).unwrap();
        fs::write(tmp.path().join("sub/d.txt"), "d").unwrap();
        fs::write(tmp.path().join("sub/drafts/e.txt"), "e").unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join(".git/f.txt"), "f").unwrap();

        let snap = watcher(tmp.path(), Duration::from_secs(1)).scan();
        let mut keys: Vec<&String> = snap.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["a.txt", "b.MD", "sub/d.txt"]);
        assert_eq!(snap["a.txt"], hex::encode(Sha256::digest(b"a")));
    }

    #[test]
    fn test_missing_root_scans_empty() {
        let w = watcher(Path::new("/no/such/dir"), Duration::from_secs(1));
        assert!(w.scan().is_empty());
    }

    #[test]
    fn test_diff_sets() {
        let known: Snapshot = [("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let current: Snapshot = [("b", "2"), ("c", "9"), ("d", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let changes = diff_snapshots(&known, &current);
        assert_eq!(changes.created, vec!["d"]);
        assert_eq!(changes.modified, vec!["c"]);
        assert_eq!(changes.deleted, vec!["a"]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_snapshot_sets_baseline() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let w = watcher(tmp.path(), Duration::from_secs(1));
        assert_eq!(w.diff(&w.scan()).created, vec!["a.txt"]);
        w.snapshot();
        assert!(w.diff(&w.scan()).is_empty());
        w.set_known(Snapshot::new());
        assert_eq!(w.diff(&w.scan()).created.len(), 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let tmp = TempDir::new().unwrap();
        let w = watcher(tmp.path(), Duration::from_millis(20));
        let handler: Arc<dyn WatchHandler> = Arc::new(Recorder::default());
        w.stop();
        w.start(Arc::clone(&handler)).unwrap();
        w.start(Arc::clone(&handler)).unwrap();
        assert!(w.is_running());
        w.stop();
        w.stop();
        assert!(!w.is_running());
    }

    #[test]
    fn test_poll_loop_reports_changes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep.txt"), "v1").unwrap();
        fs::write(tmp.path().join("gone.txt"), "bye").unwrap();
        let w = watcher(tmp.path(), Duration::from_millis(20));
        w.snapshot();

        let recorder = Arc::new(Recorder::default());
        w.start(recorder.clone()).unwrap();
        fs::write(tmp.path().join("keep.txt"), "v2").unwrap();
        fs::remove_file(tmp.path().join("gone.txt")).unwrap();
        fs::write(tmp.path().join("new.md"), "hi").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&recorder.events).len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        w.stop();

        let mut events = lock(&recorder.events).clone();
        events.sort();
        events.dedup();
        assert!(events.contains(&"created:new.md".to_string()));
        assert!(events.contains(&"modified:keep.txt".to_string()));
        assert!(events.contains(&"deleted:gone.txt".to_string()));
    }
}

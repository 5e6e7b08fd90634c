//! Discovery Module
//!
//! Scans library class roots for `.js` files and watches them for changes.
//! Every root is scanned fully before discovery counts as started; after that
//! native file system events are turned into classname-keyed add, change and
//! remove events.

use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::DiscoveryError;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Starting,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryEventKind {
    Added,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub classname: String,
    pub path: PathBuf,
}

/// What the watch stream carries: an event, or a stat failure that is not a
/// plain unlink race.
pub type DiscoveryMessage = Result<DiscoveryEvent, DiscoveryError>;

type KnownClasses = Arc<Mutex<BTreeMap<String, PathBuf>>>;

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Discovery {
    roots: Vec<PathBuf>,
    state: DiscoveryState,
    known: KnownClasses,
    watchers: Vec<(PathBuf, RecommendedWatcher)>,
    events_tx: mpsc::UnboundedSender<DiscoveryMessage>,
    events_rx: Option<mpsc::UnboundedReceiver<DiscoveryMessage>>,
}

impl Discovery {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            roots: Vec::new(),
            state: DiscoveryState::Idle,
            known: Arc::new(Mutex::new(BTreeMap::new())),
            watchers: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Register a class root. Roots cannot be added once `start` was called.
    /// Roots are stored canonical so they match the paths watchers report.
    pub fn add_root(&mut self, root: impl Into<PathBuf>) -> Result<(), DiscoveryError> {
        let root = root.into();
        if self.state != DiscoveryState::Idle {
            return Err(DiscoveryError::AlreadyStarted(root));
        }
        if !root.is_dir() {
            return Err(DiscoveryError::MissingRoot(root));
        }
        let root = std::fs::canonicalize(&root).map_err(|_| DiscoveryError::MissingRoot(root))?;
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
        Ok(())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Scan every root, then optionally attach a native watcher to each.
    pub fn start(&mut self, watch: bool) -> Result<(), DiscoveryError> {
        if self.state != DiscoveryState::Idle {
            return Err(DiscoveryError::AlreadyStarted(
                self.roots.first().cloned().unwrap_or_default(),
            ));
        }
        self.state = DiscoveryState::Starting;

        for root in &self.roots {
            let found = scan_root(root);
            tracing::debug!(root = %root.display(), classes = found.len(), "scanned class root");
            self.known.lock().extend(found);
        }

        if watch {
            for root in self.roots.clone() {
                let known = self.known.clone();
                let tx = self.events_tx.clone();
                let watch_root = root.clone();
                let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
                    match res {
                        Ok(event) => {
                            for translated in translate_event(&known, &watch_root, &event) {
                                // The receiver is gone once the controller shuts down.
                                let _ = tx.send(translated);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "file watcher error"),
                    }
                })?;
                watcher.watch(&root, RecursiveMode::Recursive)?;
                self.watchers.push((root, watcher));
            }
        }

        self.state = DiscoveryState::Started;
        tracing::info!(classes = self.known.lock().len(), watching = watch, "discovery started");
        Ok(())
    }

    /// Close every watcher. Returns once all of them are gone.
    pub fn stop(&mut self) {
        for (root, mut watcher) in self.watchers.drain(..) {
            if let Err(e) = watcher.unwatch(&root) {
                tracing::debug!(root = %root.display(), error = %e, "unwatch failed");
            }
        }
        self.state = DiscoveryState::Stopped;
    }

    /// The receiving end of the event stream. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveryMessage>> {
        self.events_rx.take()
    }

    pub fn classes(&self) -> Vec<(String, PathBuf)> {
        self.known
            .lock()
            .iter()
            .map(|(c, p)| (c.clone(), p.clone()))
            .collect()
    }

    pub fn class_file(&self, classname: &str) -> Option<PathBuf> {
        self.known.lock().get(classname).cloned()
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// `root/app/ui/Button.js` → `app.ui.Button`. Paths outside the root, in dot
/// directories or without a `.js` suffix have no classname.
pub fn classname_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let stem = relative.to_str()?.strip_suffix(".js")?;
    let segments: Vec<&str> = stem.split(['/', '\\']).collect();
    if segments.iter().any(|s| s.is_empty() || s.starts_with('.')) {
        return None;
    }
    Some(segments.join("."))
}

fn scan_root(root: &Path) -> BTreeMap<String, PathBuf> {
    let mut found = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(classname) = classname_for(root, entry.path()) {
            found.insert(classname, entry.path().to_path_buf());
        }
    }
    found
}

/// Turn one native event into classname events, updating `known`. A file
/// that vanished between the event and the stat is treated as removed.
pub(crate) fn translate_event(
    known: &Mutex<BTreeMap<String, PathBuf>>,
    root: &Path,
    event: &notify::Event,
) -> Vec<DiscoveryMessage> {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return Vec::new();
    }
    let mut out = Vec::new();
    for path in &event.paths {
        let path = &canonical_event_path(path);
        let Some(classname) = classname_for(root, path) else {
            continue;
        };
        let exists = match std::fs::metadata(path) {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => {
                out.push(Err(DiscoveryError::TransientIo {
                    path: path.clone(),
                    source,
                }));
                continue;
            }
        };

        let mut known = known.lock();
        let kind = if matches!(event.kind, EventKind::Remove(_)) || !exists {
            match known.remove(&classname) {
                Some(_) => DiscoveryEventKind::Removed,
                None => continue,
            }
        } else {
            match known.insert(classname.clone(), path.clone()) {
                None => DiscoveryEventKind::Added,
                Some(_) => DiscoveryEventKind::Changed,
            }
        };
        out.push(Ok(DiscoveryEvent {
            kind,
            classname,
            path: path.clone(),
        }));
    }
    out
}

/// Resolve symlinks and `.` segments. A removed file cannot be resolved, so
/// its directory is resolved instead.
fn canonical_event_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    match (path.parent().and_then(|dir| std::fs::canonicalize(dir).ok()), path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

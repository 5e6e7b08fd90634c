//! Incremental compilation cache.
//!
//! Keyed by (output directory, classname). Each entry holds at most one
//! in-flight compile, shared by every caller that asks while it runs. A
//! class marked dirty during a compile is compiled again as soon as that
//! compile finishes; a dirty entry never serves its cached result.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::class_compiler::CompiledClassInfo;
use crate::error::CompileFailure;

pub type CompileOutcome = Result<Arc<CompiledClassInfo>, CompileFailure>;

/// Resolves to the outcome and whether the entry went dirty meanwhile.
pub type CompileFuture = Shared<BoxFuture<'static, (CompileOutcome, bool)>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub output_dir: PathBuf,
    pub classname: String,
}

impl CacheKey {
    pub fn new(output_dir: &Path, classname: &str) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            classname: classname.to_string(),
        }
    }
}

#[derive(Default)]
struct CacheEntry {
    compiling: Option<CompileFuture>,
    dirty: bool,
    cached: Option<Arc<CompiledClassInfo>>,
}

pub enum CacheLookup {
    Ready(Arc<CompiledClassInfo>),
    Pending { future: CompileFuture, started: bool },
}

#[derive(Default)]
pub struct CompilationCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl CompilationCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The clean cached result, the compile already running, or a new
    /// compile built from `start`. A started compile runs to completion on
    /// the runtime even if every waiter goes away.
    pub fn lookup_or_start<F>(self: &Arc<Self>, key: &CacheKey, force: bool, start: F) -> CacheLookup
    where
        F: FnOnce() -> BoxFuture<'static, CompileOutcome>,
    {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        if let Some(future) = &entry.compiling {
            if force {
                entry.dirty = true;
            }
            return CacheLookup::Pending {
                future: future.clone(),
                started: false,
            };
        }
        if !force && !entry.dirty {
            if let Some(info) = &entry.cached {
                return CacheLookup::Ready(info.clone());
            }
        }

        entry.dirty = false;
        let cache = Arc::clone(self);
        let finished_key = key.clone();
        let compile = start();
        let future = async move {
            let outcome = compile.await;
            let follow_up = cache.finish(&finished_key, &outcome);
            (outcome, follow_up)
        }
        .boxed()
        .shared();
        entry.compiling = Some(future.clone());
        drop(entries);

        tokio::spawn(future.clone());
        CacheLookup::Pending {
            future,
            started: true,
        }
    }

    fn finish(&self, key: &CacheKey, outcome: &CompileOutcome) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.compiling = None;
        entry.cached = outcome.as_ref().ok().cloned();
        entry.dirty
    }

    /// Mark one class dirty in one output.
    pub fn mark_dirty(&self, key: &CacheKey) {
        self.entries.lock().entry(key.clone()).or_default().dirty = true;
    }

    /// Mark a class dirty in every output it was compiled into.
    pub fn mark_class_dirty(&self, classname: &str) -> usize {
        let mut marked = 0;
        for (key, entry) in self.entries.lock().iter_mut() {
            if key.classname == classname {
                entry.dirty = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn is_dirty(&self, key: &CacheKey) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.dirty)
    }

    pub fn cached(&self, key: &CacheKey) -> Option<Arc<CompiledClassInfo>> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.dirty {
            return None;
        }
        entry.cached.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.compiling.is_some())
            .count()
    }

    /// Forget every idle entry of one output, after its files were erased.
    pub fn clear_output(&self, output_dir: &Path) {
        self.entries
            .lock()
            .retain(|key, entry| key.output_dir != output_dir || entry.compiling.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn info(classname: &str, hash: &str) -> Arc<CompiledClassInfo> {
        Arc::new(CompiledClassInfo {
            classname: classname.to_string(),
            hash: hash.to_string(),
            source_mtime: 0,
            depends_on: BTreeMap::new(),
            translations: Vec::new(),
            assets: Vec::new(),
            environment: Vec::new(),
            markers: Vec::new(),
        })
    }

    async fn resolve(lookup: CacheLookup) -> (CompileOutcome, bool) {
        match lookup {
            CacheLookup::Ready(info) => (Ok(info), false),
            CacheLookup::Pending { future, .. } => future.await,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_compile() {
        let cache = CompilationCache::new();
        let key = CacheKey::new(Path::new("out"), "app.Main");
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let start = || {
            let runs = runs.clone();
            let gate = gate.clone();
            move || -> BoxFuture<'static, CompileOutcome> {
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, CompileFailure>(info("app.Main", "h1"))
                }
                .boxed()
            }
        };

        let first = cache.lookup_or_start(&key, false, start());
        let second = cache.lookup_or_start(&key, false, start());
        assert!(matches!(first, CacheLookup::Pending { started: true, .. }));
        assert!(matches!(second, CacheLookup::Pending { started: false, .. }));
        assert_eq!(cache.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();
        let (a, b) = futures::join!(resolve(first), resolve(second));
        assert_eq!(a.0.unwrap().hash, "h1");
        assert_eq!(b.0.unwrap().hash, "h1");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Clean and cached: no new compile.
        let third = cache.lookup_or_start(&key, false, start());
        assert!(matches!(third, CacheLookup::Ready(_)));
    }

    #[tokio::test]
    async fn test_dirty_during_compile_requests_follow_up() {
        let cache = CompilationCache::new();
        let key = CacheKey::new(Path::new("out"), "app.Main");
        let gate = Arc::new(Notify::new());

        let waiting = gate.clone();
        let lookup = cache.lookup_or_start(&key, false, move || {
            async move {
                waiting.notified().await;
                Ok::<_, CompileFailure>(info("app.Main", "stale"))
            }
            .boxed()
        });
        assert_eq!(cache.mark_class_dirty("app.Main"), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();

        let (outcome, follow_up) = resolve(lookup).await;
        assert!(outcome.is_ok());
        assert!(follow_up);
        assert!(cache.cached(&key).is_none());

        let again = cache.lookup_or_start(&key, false, || async { Ok::<_, CompileFailure>(info("app.Main", "fresh")) }.boxed());
        assert!(matches!(again, CacheLookup::Pending { started: true, .. }));
        let (outcome, follow_up) = resolve(again).await;
        assert_eq!(outcome.unwrap().hash, "fresh");
        assert!(!follow_up);
        assert_eq!(cache.cached(&key).unwrap().hash, "fresh");
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = CompilationCache::new();
        let key = CacheKey::new(Path::new("out"), "app.Bad");
        let lookup = cache.lookup_or_start(&key, false, || {
            async { Err::<Arc<CompiledClassInfo>, _>(CompileFailure::new("app.Bad", "syntax error")) }.boxed()
        });
        let (outcome, _) = resolve(lookup).await;
        assert_eq!(outcome.unwrap_err().message, "syntax error");
        assert!(cache.cached(&key).is_none());

        cache.clear_output(Path::new("out"));
        assert_eq!(cache.in_flight(), 0);
    }
}

//! Controller
//!
//! Incremental build scheduler. Per (output, class) a compile is clean,
//! dirty or compiling; concurrent requests for the same key share one
//! compile. When a class finishes, every maker that needs it is marked
//! pending and, once the wave of in-flight compiles drains, the pending
//! makers run in one batch. A maker never runs twice at once: a request
//! during a make joins it, and a maker marked dirty meanwhile runs again.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::analyser::{Analyser, ClassCompileService};
use crate::backend::CompileBackend;
use crate::cache::{CacheKey, CacheLookup, CompilationCache, CompileOutcome};
use crate::class_compiler::{load_if_up_to_date, CompileRequest, CompiledClassInfo};
use crate::discovery::{DiscoveryEvent, DiscoveryEventKind};
use crate::error::{CompileFailure, MetaError};
use crate::events::{CompilerEvent, EventBus};
use crate::maker::{MakeOutcome, MakeServices, Maker};
use crate::meta_db::MetaDatabase;

pub type MakeResult = Result<MakeOutcome, String>;
type MakeFuture = Shared<BoxFuture<'static, MakeResult>>;

#[derive(Default)]
struct MakeSlot {
    running: Option<MakeFuture>,
    dirty: bool,
}

#[derive(Default)]
struct Wave {
    in_flight: usize,
    pending_makers: BTreeSet<usize>,
}

struct ControllerInner {
    meta: Mutex<MetaDatabase>,
    meta_version: AtomicU64,
    snapshot_version: tokio::sync::Mutex<u64>,
    classes: RwLock<BTreeMap<String, PathBuf>>,
    backend: Arc<dyn CompileBackend>,
    cache: Arc<CompilationCache>,
    makers: Vec<Arc<Maker>>,
    events: EventBus,
    auto_make: AtomicBool,
    wave: Mutex<Wave>,
    making: Mutex<HashMap<usize, MakeSlot>>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(
        meta: MetaDatabase,
        classes: BTreeMap<String, PathBuf>,
        backend: Arc<dyn CompileBackend>,
        makers: Vec<Arc<Maker>>,
        events: EventBus,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            meta: Mutex::new(meta),
            meta_version: AtomicU64::new(1),
            snapshot_version: tokio::sync::Mutex::new(0),
            classes: RwLock::new(classes),
            backend,
            cache: CompilationCache::new(),
            makers,
            events,
            auto_make: AtomicBool::new(false),
            wave: Mutex::new(Wave::default()),
            making: Mutex::new(HashMap::new()),
        });
        Self { inner }
    }

    pub fn makers(&self) -> &[Arc<Maker>] {
        &self.inner.makers
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn with_meta<R>(&self, f: impl FnOnce(&MetaDatabase) -> R) -> R {
        f(&self.inner.meta.lock())
    }

    /// Remake affected makers by themselves as compiles finish. Off until
    /// the first full make is done.
    pub fn set_auto_make(&self, enabled: bool) {
        self.inner.auto_make.store(enabled, Ordering::SeqCst);
    }

    pub async fn compile_class(
        &self,
        analyser: &Arc<Analyser>,
        classname: &str,
        force: bool,
    ) -> Result<Arc<CompiledClassInfo>, CompileFailure> {
        self.inner.compile_class(analyser, classname, force).await
    }

    /// Run every maker once, concurrently.
    pub async fn make_all(&self) -> Vec<MakeResult> {
        let requests = (0..self.inner.makers.len()).map(|i| self.inner.request_make(i, false));
        join_all(requests).await
    }

    pub async fn make_maker(&self, index: usize) -> MakeResult {
        self.inner.request_make(index, false).await
    }

    /// Make after a change: a make already running is followed by another.
    pub async fn remake_maker(&self, index: usize) -> MakeResult {
        self.inner.request_make(index, true).await
    }

    /// Apply one discovery event: update metadata, then recompile the class
    /// for every maker that needs it. Removals go straight to a remake.
    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) {
        let inner = &self.inner;
        let DiscoveryEvent {
            kind,
            classname,
            path,
        } = event;

        let updated = {
            let mut meta = inner.meta.lock();
            let result = match kind {
                DiscoveryEventKind::Added | DiscoveryEventKind::Changed => meta
                    .add_class_file(Some(&classname), &path, false)
                    .map(|_| ()),
                DiscoveryEventKind::Removed => meta.remove_file(&path).map(|_| ()),
            };
            let result = result.and_then(|_| meta.reparse_all().map(|_| ()));
            for warning in meta.take_warnings() {
                tracing::warn!(classname = %warning.classname, "{}", warning.message);
            }
            result
        };
        if let Err(e) = updated {
            tracing::warn!(classname = %classname, error = %e, "metadata update failed");
        }
        inner.meta_version.fetch_add(1, Ordering::SeqCst);
        inner.cache.mark_class_dirty(&classname);

        let dependent: Vec<usize> = inner
            .makers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.depends_on_class(&classname))
            .map(|(i, _)| i)
            .collect();

        match kind {
            DiscoveryEventKind::Added | DiscoveryEventKind::Changed => {
                inner.classes.write().insert(classname.clone(), path);
                inner.events.emit(if kind == DiscoveryEventKind::Added {
                    CompilerEvent::ClassAdded {
                        classname: classname.clone(),
                    }
                } else {
                    CompilerEvent::ClassChanged {
                        classname: classname.clone(),
                    }
                });
                let compiles = dependent.iter().map(|&i| {
                    let analyser = inner.makers[i].analyser().clone();
                    let classname = classname.clone();
                    async move { inner.compile_class(&analyser, &classname, false).await }
                });
                for result in join_all(compiles).await {
                    if let Err(failure) = result {
                        tracing::warn!(classname = %failure.classname, error = %failure.message, "recompile failed");
                    }
                }
            }
            DiscoveryEventKind::Removed => {
                inner.classes.write().remove(&classname);
                inner.events.emit(CompilerEvent::ClassRemoved {
                    classname: classname.clone(),
                });
                if inner.auto_make.load(Ordering::SeqCst) {
                    let remakes = dependent.iter().map(|&i| inner.request_make(i, true));
                    join_all(remakes).await;
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILING
// ═══════════════════════════════════════════════════════════════════════════════

impl ControllerInner {
    async fn compile_class(
        self: &Arc<Self>,
        analyser: &Arc<Analyser>,
        classname: &str,
        force: bool,
    ) -> Result<Arc<CompiledClassInfo>, CompileFailure> {
        let key = CacheKey::new(analyser.output_dir(), classname);
        let mut force = force;
        loop {
            let lookup = self.cache.lookup_or_start(&key, force, || {
                self.clone().start_compile(analyser.clone(), classname.to_string(), force)
            });
            match lookup {
                CacheLookup::Ready(info) => return Ok(info),
                CacheLookup::Pending { future, .. } => {
                    let (outcome, follow_up) = future.await;
                    if !follow_up {
                        return outcome;
                    }
                    tracing::debug!(classname, "class changed during compile, compiling again");
                    force = false;
                }
            }
        }
    }

    fn start_compile(
        self: Arc<Self>,
        analyser: Arc<Analyser>,
        classname: String,
        force: bool,
    ) -> BoxFuture<'static, CompileOutcome> {
        self.wave.lock().in_flight += 1;
        async move {
            let outcome = self.run_compile(&analyser, &classname, force).await;
            self.compile_finished(&classname);
            outcome
        }
        .boxed()
    }

    async fn run_compile(&self, analyser: &Arc<Analyser>, classname: &str, force: bool) -> CompileOutcome {
        let target = analyser.target().to_string();
        let source_path = self
            .classes
            .read()
            .get(classname)
            .cloned()
            .ok_or_else(|| CompileFailure::new(classname, "no source file for class"))?;

        if !force {
            if let Some(info) = load_if_up_to_date(analyser.output_dir(), classname, &source_path) {
                self.events.emit(CompilerEvent::CompiledClass {
                    classname: classname.to_string(),
                    target,
                    transpiled: false,
                });
                return Ok(Arc::new(info));
            }
        }

        self.events.emit(CompilerEvent::CompilingClass {
            classname: classname.to_string(),
            target: target.clone(),
        });
        self.ensure_snapshot()
            .await
            .map_err(|e| CompileFailure::new(classname, e.to_string()))?;
        let info = Arc::new(
            self.backend
                .compile(CompileRequest {
                    classname: classname.to_string(),
                    source_path,
                    output_dir: analyser.output_dir().to_path_buf(),
                    minify: analyser.minify(),
                })
                .await?,
        );
        analyser.note_compiled(info.clone());
        self.events.emit(CompilerEvent::CompiledClass {
            classname: classname.to_string(),
            target,
            transpiled: true,
        });
        Ok(info)
    }

    /// Push the current metadata to the backend if it changed since the
    /// last push.
    async fn ensure_snapshot(&self) -> Result<(), crate::error::PoolError> {
        let mut pushed = self.snapshot_version.lock().await;
        let current = self.meta_version.load(Ordering::SeqCst);
        if *pushed == current {
            return Ok(());
        }
        let snapshot = Arc::new(self.meta.lock().snapshot());
        self.backend.update_snapshot(snapshot).await?;
        *pushed = current;
        Ok(())
    }

    fn compile_finished(self: &Arc<Self>, classname: &str) {
        let drain = {
            let mut wave = self.wave.lock();
            wave.in_flight = wave.in_flight.saturating_sub(1);
            if self.auto_make.load(Ordering::SeqCst) {
                for (i, maker) in self.makers.iter().enumerate() {
                    if maker.depends_on_class(classname) {
                        wave.pending_makers.insert(i);
                    }
                }
            }
            if wave.in_flight == 0 && !wave.pending_makers.is_empty() {
                std::mem::take(&mut wave.pending_makers)
            } else {
                BTreeSet::new()
            }
        };
        if !drain.is_empty() {
            let inner = self.clone();
            tokio::spawn(async move {
                tracing::debug!(makers = drain.len(), "compile wave drained, remaking");
                let remakes = drain.into_iter().map(|i| inner.request_make(i, true));
                for result in join_all(remakes).await {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "remake failed");
                    }
                }
            });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MAKING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run maker `index`, or join its running make. With `dirty`, a running
    /// make is followed by another one.
    async fn request_make(self: &Arc<Self>, index: usize, dirty: bool) -> MakeResult {
        loop {
            let (future, started) = {
                let mut making = self.making.lock();
                let slot = making.entry(index).or_default();
                match &slot.running {
                    Some(running) => {
                        slot.dirty |= dirty;
                        (running.clone(), false)
                    }
                    None => {
                        slot.dirty = false;
                        let future = self.clone().run_make(index).boxed().shared();
                        slot.running = Some(future.clone());
                        (future, true)
                    }
                }
            };

            let outcome = future.await;
            if !started {
                return outcome;
            }
            let again = {
                let mut making = self.making.lock();
                let slot = making.entry(index).or_default();
                slot.running = None;
                std::mem::take(&mut slot.dirty)
            };
            if !again {
                return outcome;
            }
            tracing::debug!(maker = index, "maker went dirty during make, running again");
        }
    }

    async fn run_make(self: Arc<Self>, index: usize) -> MakeResult {
        let maker = self
            .makers
            .get(index)
            .cloned()
            .ok_or_else(|| format!("no maker {}", index))?;
        let services = Controller { inner: self };
        maker.make(&services).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ClassCompileService for Controller {
    async fn compile_class(
        &self,
        analyser: &Arc<Analyser>,
        classname: &str,
        force: bool,
    ) -> Result<Arc<CompiledClassInfo>, CompileFailure> {
        self.inner.compile_class(analyser, classname, force).await
    }

    fn class_exists(&self, classname: &str) -> bool {
        self.inner.classes.read().contains_key(classname)
    }
}

#[async_trait]
impl MakeServices for Controller {
    fn compile_service(&self) -> &dyn ClassCompileService {
        self
    }

    fn known_classes(&self) -> Vec<String> {
        self.inner.meta.lock().classnames().cloned().collect()
    }

    async fn save_meta(&self) -> Result<(), MetaError> {
        self.inner.meta.lock().save()
    }

    fn output_erased(&self, output_dir: &Path) {
        self.inner.cache.clear_output(output_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::meta_db::MetaSnapshot;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts compiles and takes a while over each.
    struct CountingBackend {
        compiles: AtomicUsize,
    }

    #[async_trait]
    impl CompileBackend for CountingBackend {
        async fn update_snapshot(&self, _: Arc<MetaSnapshot>) -> Result<(), PoolError> {
            Ok(())
        }

        async fn compile(&self, request: CompileRequest) -> Result<CompiledClassInfo, CompileFailure> {
            let n = self.compiles.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(CompiledClassInfo {
                classname: request.classname,
                hash: format!("run-{}", n),
                source_mtime: 0,
                depends_on: BTreeMap::new(),
                translations: Vec::new(),
                assets: Vec::new(),
                environment: Vec::new(),
                markers: Vec::new(),
            })
        }
    }

    fn setup(dir: &Path) -> (Controller, Arc<CountingBackend>, Arc<Analyser>) {
        let source = dir.join("app/X.js");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, "qx.Class.define(\"app.X\", {});\n").unwrap();

        let backend = Arc::new(CountingBackend {
            compiles: AtomicUsize::new(0),
        });
        let controller = Controller::new(
            MetaDatabase::new(dir.join("meta")),
            BTreeMap::from([("app.X".to_string(), source)]),
            backend.clone(),
            Vec::new(),
            EventBus::new(),
        );
        let analyser = Analyser::new("source", dir.join("out"), false, BTreeMap::new(), BTreeMap::new());
        (controller, backend, analyser)
    }

    #[tokio::test]
    async fn test_concurrent_compiles_transform_once() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, backend, analyser) = setup(dir.path());

        let (a, b) = futures::join!(
            controller.compile_class(&analyser, "app.X", false),
            controller.compile_class(&analyser, "app.X", false)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);
        assert!(analyser.take_recently_compiled().contains("app.X"));

        // Clean: served from the cache.
        controller.compile_class(&analyser, "app.X", false).await.unwrap();
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);

        // Forced: compiled again.
        let forced = controller.compile_class(&analyser, "app.X", true).await.unwrap();
        assert_eq!(forced.hash, "run-1");
    }

    #[tokio::test]
    async fn test_dirty_mark_during_compile_compiles_again() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, backend, analyser) = setup(dir.path());

        let inner = controller.inner.clone();
        let compile = controller.compile_class(&analyser, "app.X", false);
        let mark = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner.cache.mark_class_dirty("app.X");
        };
        let (info, ()) = futures::join!(compile, mark);
        assert_eq!(info.unwrap().hash, "run-1");
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_class_fails_without_compiling() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, backend, analyser) = setup(dir.path());
        let failure = controller
            .compile_class(&analyser, "app.Missing", false)
            .await
            .unwrap_err();
        assert_eq!(failure.classname, "app.Missing");
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 0);
    }
}

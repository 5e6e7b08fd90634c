//! Analyser
//!
//! One analyser per target output. It grows the root classes of the target's
//! applications to their full dependency closure by compiling classes until
//! no new names appear, and keeps the build database that decides whether
//! earlier output can be reused at all.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::class_compiler::CompiledClassInfo;
use crate::error::{CompileFailure, MakerError};
use crate::marker::{CompileMarker, MARKER_MISSING_CLASS};

pub const BUILD_DB_FILE: &str = "db.json";
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fingerprint of the inputs that all output in a target depends on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildDatabase {
    pub libraries: BTreeMap<String, String>,
    pub environment_hash: String,
    pub compiler_version: String,
    #[serde(default)]
    pub classes: Vec<String>,
}

impl BuildDatabase {
    fn same_context(&self, other: &BuildDatabase) -> bool {
        self.libraries == other.libraries
            && self.environment_hash == other.environment_hash
            && self.compiler_version == other.compiler_version
    }
}

pub fn environment_hash(environment: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    // BTreeMap keys serialize in order, so equal maps hash equally.
    hasher.update(serde_json::to_string(environment).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// What the analyser needs from whoever schedules compiles.
#[async_trait]
pub trait ClassCompileService: Send + Sync {
    async fn compile_class(
        &self,
        analyser: &Arc<Analyser>,
        classname: &str,
        force: bool,
    ) -> Result<Arc<CompiledClassInfo>, CompileFailure>;

    fn class_exists(&self, classname: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct AnalysisOutcome {
    pub classes: Vec<String>,
    pub failures: Vec<CompileFailure>,
    pub markers: Vec<CompileMarker>,
}

impl AnalysisOutcome {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct AnalyserState {
    roots: BTreeSet<String>,
    classes: BTreeMap<String, Arc<CompiledClassInfo>>,
    /// Load dependencies after following construct edges of load deps.
    load_deps: BTreeMap<String, BTreeSet<String>>,
    recently_compiled: BTreeSet<String>,
}

pub struct Analyser {
    target: String,
    output_dir: PathBuf,
    minify: bool,
    environment: BTreeMap<String, Value>,
    libraries: BTreeMap<String, String>,
    state: Mutex<AnalyserState>,
}

impl Analyser {
    pub fn new(
        target: &str,
        output_dir: impl Into<PathBuf>,
        minify: bool,
        environment: BTreeMap<String, Value>,
        libraries: BTreeMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_string(),
            output_dir: output_dir.into(),
            minify,
            environment,
            libraries,
            state: Mutex::new(AnalyserState::default()),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn minify(&self) -> bool {
        self.minify
    }

    pub fn environment(&self) -> &BTreeMap<String, Value> {
        &self.environment
    }

    pub fn add_roots<'a>(&self, classnames: impl IntoIterator<Item = &'a String>) {
        self.state.lock().roots.extend(classnames.into_iter().cloned());
    }

    /// Replace the root set. Classes no application asks for any more stop
    /// being roots.
    pub fn set_roots(&self, classnames: impl IntoIterator<Item = String>) {
        self.state.lock().roots = classnames.into_iter().collect();
    }

    pub fn roots(&self) -> Vec<String> {
        self.state.lock().roots.iter().cloned().collect()
    }

    pub fn class_info(&self, classname: &str) -> Option<Arc<CompiledClassInfo>> {
        self.state.lock().classes.get(classname).cloned()
    }

    pub fn classes(&self) -> Vec<String> {
        self.state.lock().classes.keys().cloned().collect()
    }

    pub fn contains_class(&self, classname: &str) -> bool {
        self.state.lock().classes.contains_key(classname)
    }

    /// Record a compile that produced new output, as opposed to a cache hit.
    pub fn note_compiled(&self, info: Arc<CompiledClassInfo>) {
        let mut state = self.state.lock();
        state.recently_compiled.insert(info.classname.clone());
        state.classes.insert(info.classname.clone(), info);
    }

    pub fn take_recently_compiled(&self) -> BTreeSet<String> {
        std::mem::take(&mut self.state.lock().recently_compiled)
    }

    pub fn load_deps(&self, classname: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .load_deps
            .get(classname)
            .cloned()
            .unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DEPENDENCY EXPANSION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Compile the roots and everything they reach until nothing new turns up.
    pub async fn resolve_dependencies(
        self: &Arc<Self>,
        service: &dyn ClassCompileService,
    ) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome::default();
        let roots = self.roots();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut frontier: Vec<String> = Vec::new();
        for root in roots {
            if service.class_exists(&root) {
                seen.insert(root.clone());
                frontier.push(root);
            } else {
                outcome.markers.push(CompileMarker::error(
                    MARKER_MISSING_CLASS,
                    &root,
                    format!("Application class {} does not exist", root),
                ));
            }
        }

        while !frontier.is_empty() {
            let results = join_all(
                frontier
                    .iter()
                    .map(|classname| service.compile_class(self, classname, false)),
            )
            .await;

            let mut next = Vec::new();
            for (classname, result) in frontier.iter().zip(results) {
                let info = match result {
                    Ok(info) => info,
                    Err(failure) => {
                        tracing::warn!(classname, error = %failure.message, "class failed to compile");
                        outcome.failures.push(failure);
                        continue;
                    }
                };
                for dep in info.depends_on.keys() {
                    if seen.contains(dep) {
                        continue;
                    }
                    seen.insert(dep.clone());
                    if service.class_exists(dep) {
                        next.push(dep.clone());
                    } else {
                        outcome.markers.push(CompileMarker::warning(
                            MARKER_MISSING_CLASS,
                            classname,
                            format!("Dependency {} does not exist", dep),
                        ));
                    }
                }
                self.state.lock().classes.insert(classname.clone(), info);
            }
            frontier = next;
        }

        let mut state = self.state.lock();
        state.classes.retain(|classname, _| seen.contains(classname));
        state.load_deps = indirect_load_deps(&state.classes);
        outcome.classes = state.classes.keys().cloned().collect();
        tracing::info!(
            target = %self.target,
            classes = outcome.classes.len(),
            failures = outcome.failures.len(),
            "dependencies resolved"
        );
        outcome
    }

    /// Classes in the order they must load: load dependencies depth first,
    /// then whatever the roots need only at run time.
    pub fn load_order(&self, roots: &[String]) -> Vec<String> {
        let state = self.state.lock();
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        for root in roots {
            visit_load(root, &state, &mut visited, &mut order);
        }
        let mut queue: Vec<String> = order.clone();
        while let Some(classname) = queue.pop() {
            let Some(info) = state.classes.get(&classname) else {
                continue;
            };
            for dep in info.depends_on.keys() {
                if state.classes.contains_key(dep) && !visited.contains(dep) {
                    let before = order.len();
                    visit_load(dep, &state, &mut visited, &mut order);
                    queue.extend(order[before..].iter().cloned());
                }
            }
        }
        order
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BUILD DATABASE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn current_context(&self) -> BuildDatabase {
        BuildDatabase {
            libraries: self.libraries.clone(),
            environment_hash: environment_hash(&self.environment),
            compiler_version: COMPILER_VERSION.to_string(),
            classes: self.classes(),
        }
    }

    pub fn load_database(&self) -> Option<BuildDatabase> {
        let data = fs::read_to_string(self.output_dir.join(BUILD_DB_FILE)).ok()?;
        match serde_json::from_str(&data) {
            Ok(db) => Some(db),
            Err(e) => {
                tracing::warn!(target = %self.target, error = %e, "ignoring unreadable build database");
                None
            }
        }
    }

    /// Whether libraries, environment or compiler differ from the last build.
    /// A missing database counts as changed.
    pub fn is_context_changed(&self) -> bool {
        match self.load_database() {
            Some(previous) => !previous.same_context(&self.current_context()),
            None => true,
        }
    }

    /// Forget every compiled class, ready for a build from scratch.
    pub fn reset_database(&self) {
        let mut state = self.state.lock();
        state.classes.clear();
        state.load_deps.clear();
        state.recently_compiled.clear();
    }

    pub fn save_database(&self) -> Result<(), MakerError> {
        let path = self.output_dir.join(BUILD_DB_FILE);
        fs::create_dir_all(&self.output_dir).map_err(|e| MakerError::io(&self.output_dir, e))?;
        let data = serde_json::to_string_pretty(&self.current_context()).map_err(|e| {
            MakerError::Serialize {
                what: "build database".to_string(),
                source: e,
            }
        })?;
        fs::write(&path, data).map_err(|e| MakerError::io(&path, e))
    }
}

fn visit_load(classname: &str, state: &AnalyserState, visited: &mut BTreeSet<String>, order: &mut Vec<String>) {
    if !state.classes.contains_key(classname) || !visited.insert(classname.to_string()) {
        return;
    }
    if let Some(deps) = state.load_deps.get(classname) {
        for dep in deps {
            visit_load(dep, state, visited, order);
        }
    }
    order.push(classname.to_string());
}

/// If A is a load dependency of X, A's construct dependencies are load
/// dependencies of X too, repeated until nothing changes.
fn indirect_load_deps(classes: &BTreeMap<String, Arc<CompiledClassInfo>>) -> BTreeMap<String, BTreeSet<String>> {
    let mut result = BTreeMap::new();
    for (classname, info) in classes {
        let mut load: BTreeSet<String> = info.load_deps().cloned().collect();
        let mut pending: Vec<String> = load.iter().cloned().collect();
        while let Some(dep) = pending.pop() {
            let Some(dep_info) = classes.get(&dep) else {
                continue;
            };
            for construct in dep_info.construct_deps() {
                if construct != classname && load.insert(construct.clone()) {
                    pending.push(construct.clone());
                }
            }
        }
        result.insert(classname.clone(), load);
    }
    result
}

//! Controller scheduling over a small on-disk project: make deduplication,
//! follow-up makes, auto-make after compile waves, discovery events and
//! delegation to a compiler server.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

use crate::analyser::Analyser;
use crate::application::Application;
use crate::backend::{CompileBackend, InlineBackend};
use crate::class_compiler::{CompileRequest, CompiledClassInfo};
use crate::compiler::Compiler;
use crate::config::CompilerConfig;
use crate::controller::Controller;
use crate::discovery::{Discovery, DiscoveryEvent, DiscoveryEventKind};
use crate::error::{CompileFailure, PoolError};
use crate::events::{CompilerEvent, EventBus};
use crate::library::LibraryRegistry;
use crate::maker::Maker;
use crate::meta_db::{MetaDatabase, MetaSnapshot};
use crate::target::{SourceTarget, Target, TargetConfig};
use crate::transformer::PassthroughTransformer;

const OBJECT: &str = "qx.Class.define(\"qx.core.Object\", {\n  members: {\n    toString() { return \"object\"; }\n  }\n});\n";
const MAIN: &str = "qx.Class.define(\"app.Main\", {\n  extend: qx.core.Object,\n  members: {\n    main() { return 1; }\n  }\n});\n";
const CHART: &str = "qx.Class.define(\"app.plugins.Chart\", {\n  extend: qx.core.Object\n});\n";

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn bump_mtime(path: &Path) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(2))
        .unwrap();
}

fn manifest(name: &str, namespace: &str) -> String {
    json!({
        "info": { "name": name, "version": "1.0.0" },
        "provides": { "namespace": namespace }
    })
    .to_string()
}

fn class_file(root: &Path, classname: &str) -> PathBuf {
    root.join("app/source/class")
        .join(format!("{}.js", classname.replace('.', "/")))
}

/// Delegates to the inline backend after a pause, so overlapping requests
/// really overlap.
struct SlowBackend {
    inner: InlineBackend,
}

#[async_trait]
impl CompileBackend for SlowBackend {
    async fn update_snapshot(&self, snapshot: Arc<MetaSnapshot>) -> Result<(), PoolError> {
        self.inner.update_snapshot(snapshot).await
    }

    async fn compile(&self, request: CompileRequest) -> Result<CompiledClassInfo, CompileFailure> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.inner.compile(request).await
    }
}

/// `qx.core.Object`, `app.Main` and `app.plugins.Chart`; one source target
/// whose application pulls in every `app.plugins.*` class.
fn setup(root: &Path) -> Controller {
    write(&root.join("qx/Manifest.json"), &manifest("qooxdoo", "qx"));
    write(&root.join("qx/source/class/qx/core/Object.js"), OBJECT);
    write(&root.join("app/Manifest.json"), &manifest("app", "app"));
    write(&class_file(root, "app.Main"), MAIN);
    write(&class_file(root, "app.plugins.Chart"), CHART);

    let mut libraries = LibraryRegistry::new();
    libraries.load(&root.join("qx")).unwrap();
    libraries.load(&root.join("app")).unwrap();
    let libraries = Arc::new(libraries);

    let mut discovery = Discovery::new();
    for library in libraries.iter() {
        discovery.add_root(&library.class_path).unwrap();
    }
    discovery.start(false).unwrap();
    let classes: BTreeMap<String, PathBuf> = discovery.classes().into_iter().collect();

    let mut meta = MetaDatabase::new(root.join("compiled/meta"));
    for (classname, path) in &classes {
        meta.add_class_file(Some(classname), path, false).unwrap();
    }
    meta.reparse_all().unwrap();

    let events = EventBus::new();
    let target: Arc<dyn Target> = Arc::new(SourceTarget::new(TargetConfig {
        target_type: "source".to_string(),
        output_path: root.join("compiled/source"),
        environment: BTreeMap::new(),
        minify: None,
    }));
    let analyser = Analyser::new(
        target.name(),
        target.output_dir(),
        target.minify(),
        target.environment().clone(),
        libraries.versions(),
    );
    let application = Application {
        include: vec!["app.plugins.*".to_string()],
        ..Application::new("app.Main")
    };
    let maker = Maker::new(
        target,
        analyser,
        vec![application],
        libraries,
        Vec::new(),
        root.to_path_buf(),
        false,
        events.clone(),
    );
    let backend = Arc::new(SlowBackend {
        inner: InlineBackend::new(Arc::new(PassthroughTransformer)),
    });
    Controller::new(meta, classes, backend, vec![Arc::new(maker)], events)
}

fn drain(events: &mut broadcast::Receiver<CompilerEvent>) -> Vec<CompilerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn count_make_started(events: &[CompilerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CompilerEvent::MakeStarted { .. }))
        .count()
}

async fn wait_for_make_finished(events: &mut broadcast::Receiver<CompilerEvent>) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(CompilerEvent::MakeFinished { success, .. }) => return success,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("no make finished")
}

#[tokio::test]
async fn test_concurrent_make_requests_share_one_make() {
    let dir = tempfile::tempdir().unwrap();
    let controller = setup(dir.path());
    let mut events = controller.events().subscribe();

    let (a, b) = futures::join!(controller.make_maker(0), controller.make_maker(0));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.success, "{:?}", a.markers);
    assert_eq!(a.applications_built, b.applications_built);
    assert_eq!(count_make_started(&drain(&mut events)), 1);
}

#[tokio::test]
async fn test_remake_during_make_runs_again() {
    let dir = tempfile::tempdir().unwrap();
    let controller = setup(dir.path());
    let mut events = controller.events().subscribe();

    let remake = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.remake_maker(0).await
    };
    let (first, joined) = futures::join!(controller.make_maker(0), remake);
    assert!(first.unwrap().success);
    assert!(joined.unwrap().success);
    assert_eq!(count_make_started(&drain(&mut events)), 2);

    // Idle again: a plain request makes exactly once more.
    controller.make_maker(0).await.unwrap();
    assert_eq!(count_make_started(&drain(&mut events)), 1);
}

#[tokio::test]
async fn test_changed_class_remakes_only_with_auto_make() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let controller = setup(root);
    assert!(controller.make_maker(0).await.unwrap().success);

    let main = class_file(root, "app.Main");
    let mut events = controller.events().subscribe();
    write(&main, &MAIN.replace("return 1", "return 2"));
    bump_mtime(&main);
    controller
        .handle_discovery_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Changed,
            classname: "app.Main".to_string(),
            path: main.clone(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, CompilerEvent::ClassChanged { classname } if classname == "app.Main")));
    assert_eq!(count_make_started(&seen), 0);

    controller.set_auto_make(true);
    write(&main, &MAIN.replace("return 1", "return 3"));
    bump_mtime(&main);
    controller
        .handle_discovery_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Changed,
            classname: "app.Main".to_string(),
            path: main,
        })
        .await;
    assert!(wait_for_make_finished(&mut events).await);
}

#[tokio::test]
async fn test_added_and_removed_classes_update_the_controller() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let controller = setup(root);
    assert!(controller.make_maker(0).await.unwrap().success);
    let analyser = controller.makers()[0].analyser().clone();
    let mut events = controller.events().subscribe();

    let gauge = class_file(root, "app.plugins.Gauge");
    write(
        &gauge,
        "qx.Class.define(\"app.plugins.Gauge\", {\n  extend: qx.core.Object\n});\n",
    );
    controller
        .handle_discovery_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Added,
            classname: "app.plugins.Gauge".to_string(),
            path: gauge.clone(),
        })
        .await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CompilerEvent::ClassAdded { classname } if classname == "app.plugins.Gauge")));
    assert!(controller.with_meta(|meta| meta.classnames().any(|c| c == "app.plugins.Gauge")));
    controller
        .compile_class(&analyser, "app.plugins.Gauge", false)
        .await
        .unwrap();

    fs::remove_file(&gauge).unwrap();
    controller
        .handle_discovery_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Removed,
            classname: "app.plugins.Gauge".to_string(),
            path: gauge,
        })
        .await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CompilerEvent::ClassRemoved { classname } if classname == "app.plugins.Gauge")));
    assert!(!controller.with_meta(|meta| meta.classnames().any(|c| c == "app.plugins.Gauge")));
    let failure = controller
        .compile_class(&analyser, "app.plugins.Gauge", false)
        .await
        .unwrap_err();
    assert_eq!(failure.classname, "app.plugins.Gauge");
}

#[tokio::test]
async fn test_deleted_included_class_leaves_the_next_make_clean() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let controller = setup(root);
    let analyser = controller.makers()[0].analyser().clone();

    let first = controller.make_maker(0).await.unwrap();
    assert!(first.success, "{:?}", first.markers);
    assert!(analyser.roots().contains(&"app.plugins.Chart".to_string()));

    let chart = class_file(root, "app.plugins.Chart");
    fs::remove_file(&chart).unwrap();
    controller
        .handle_discovery_event(DiscoveryEvent {
            kind: DiscoveryEventKind::Removed,
            classname: "app.plugins.Chart".to_string(),
            path: chart,
        })
        .await;

    let second = controller.make_maker(0).await.unwrap();
    assert!(second.success, "{:?}", second.markers);
    assert!(!second.markers.iter().any(|m| m.is_error()));
    assert_eq!(analyser.roots(), vec!["app.Main".to_string()]);
    assert!(!analyser.contains_class("app.plugins.Chart"));
}

/// A stand-in server: answers the first call with a relayed make event and
/// a canned outcome.
#[cfg(unix)]
#[tokio::test]
async fn test_run_is_delegated_to_the_server_command() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("app/Manifest.json"), &manifest("app", "app"));

    let event = json!({
        "type": "event",
        "event": "compilerEvent",
        "data": { "event": "makeStarted", "data": { "target": "source" } }
    });
    let reply = json!({
        "type": "methodReturn",
        "callId": 1,
        "result": { "success": true, "hadWarnings": false, "applicationsBuilt": ["main"], "markers": [] }
    });
    let script = format!("read request; echo '{}'; echo '{}'", event, reply);
    let config = CompilerConfig::from_json(
        json!({
            "targets": [{ "type": "source", "outputPath": "compiled/source" }],
            "applications": [{ "class": "app.Main" }],
            "libraries": ["app"],
            "server": { "command": ["sh", "-c", script] }
        }),
        root,
    )
    .unwrap();

    let compiler = Compiler::new(config);
    let mut events = compiler.events().subscribe();
    let outcome = compiler.run().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.applications_built, vec!["main"]);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CompilerEvent::MakeStarted { target } if target == "source")));
    // Nothing was compiled locally.
    assert!(!root.join("compiled/source").exists());
}

#[tokio::test]
async fn test_empty_server_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = crate::server::RemoteCompiler::spawn(&[], dir.path()).err().unwrap();
    assert!(matches!(err, crate::error::CompilerError::Remote(_)));
}

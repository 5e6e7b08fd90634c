//! Maker
//!
//! Turns the dependency closure of one target into application bundles.
//! A make erases stale output when the build context changed, resolves
//! dependencies through the analyser, persists metadata and regenerates
//! only the applications whose classes or local modules changed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::analyser::{Analyser, ClassCompileService, BUILD_DB_FILE};
use crate::application::{Application, BOOT_PART};
use crate::class_compiler::TRANSPILED_DIR;
use crate::error::{MakerError, MetaError};
use crate::events::{CompilerEvent, EventBus};
use crate::library::LibraryRegistry;
use crate::marker::CompileMarker;
use crate::package::partition;
use crate::resources::ResourceIndex;
use crate::target::{ApplicationBundle, Target, RESOURCE_DIR};
use crate::translation::load_translations;

/// What a make needs from the controller that owns it.
#[async_trait]
pub trait MakeServices: Send + Sync {
    fn compile_service(&self) -> &dyn ClassCompileService;

    /// Every classname the metadata database knows.
    fn known_classes(&self) -> Vec<String>;

    async fn save_meta(&self) -> Result<(), MetaError>;

    /// Output of `output_dir` was deleted; forget anything cached for it.
    fn output_erased(&self, output_dir: &Path);
}

#[derive(Debug, Clone, Default)]
pub struct MakeOutcome {
    pub success: bool,
    pub had_warnings: bool,
    pub applications_built: Vec<String>,
    pub markers: Vec<CompileMarker>,
}

#[derive(Default)]
struct MakerState {
    generated: BTreeSet<String>,
    module_mtimes: BTreeMap<String, BTreeMap<String, u64>>,
    app_classes: BTreeMap<String, BTreeSet<String>>,
}

pub struct Maker {
    target: Arc<dyn Target>,
    analyser: Arc<Analyser>,
    applications: Vec<Application>,
    libraries: Arc<LibraryRegistry>,
    locales: Vec<String>,
    project_dir: PathBuf,
    no_erase: bool,
    events: EventBus,
    state: Mutex<MakerState>,
}

impl Maker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: Arc<dyn Target>,
        analyser: Arc<Analyser>,
        applications: Vec<Application>,
        libraries: Arc<LibraryRegistry>,
        locales: Vec<String>,
        project_dir: PathBuf,
        no_erase: bool,
        events: EventBus,
    ) -> Self {
        Self {
            target,
            analyser,
            applications,
            libraries,
            locales,
            project_dir,
            no_erase,
            events,
            state: Mutex::new(MakerState::default()),
        }
    }

    pub fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }

    pub fn analyser(&self) -> &Arc<Analyser> {
        &self.analyser
    }

    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    /// Whether any application of this maker needs `classname`, directly,
    /// as its theme, or through the classes resolved in the last make.
    pub fn depends_on_class(&self, classname: &str) -> bool {
        let state = self.state.lock();
        let empty = BTreeSet::new();
        self.applications.iter().any(|app| {
            let resolved = state.app_classes.get(&app.name()).unwrap_or(&empty);
            app.depends_on_class(classname, resolved)
        })
    }

    pub async fn make(&self, services: &dyn MakeServices) -> Result<MakeOutcome, MakerError> {
        let target_name = self.target.name().to_string();
        self.events.emit(CompilerEvent::MakeStarted {
            target: target_name.clone(),
        });
        let result = self.make_impl(services).await;
        self.events.emit(CompilerEvent::MakeFinished {
            target: target_name,
            success: result.as_ref().is_ok_and(|o| o.success),
        });
        result
    }

    async fn make_impl(&self, services: &dyn MakeServices) -> Result<MakeOutcome, MakerError> {
        if self.analyser.is_context_changed() && !self.no_erase {
            self.erase_output()?;
            services.output_erased(self.target.output_dir());
            self.analyser.reset_database();
            self.state.lock().generated.clear();
        }

        let resources = ResourceIndex::scan(self.libraries.iter().map(|l| &**l));

        let known = services.known_classes();
        self.analyser.set_roots(
            self.applications
                .iter()
                .flat_map(|app| app.required_classes(&known)),
        );
        let analysis = self
            .analyser
            .resolve_dependencies(services.compile_service())
            .await;

        services.save_meta().await?;
        self.analyser.save_database()?;

        let mut outcome = MakeOutcome {
            success: analysis.success(),
            markers: analysis.markers,
            ..MakeOutcome::default()
        };
        for failure in &analysis.failures {
            tracing::error!(classname = %failure.classname, error = %failure.message, "compile failed");
        }
        for classname in &analysis.classes {
            if let Some(info) = self.analyser.class_info(classname) {
                outcome.markers.extend(info.markers.iter().cloned());
            }
        }
        if outcome.markers.iter().any(|m| m.is_error()) {
            outcome.success = false;
        }
        outcome.had_warnings = outcome.markers.iter().any(|m| !m.is_error());

        let recently_compiled = self.analyser.take_recently_compiled();
        let translations = load_translations(self.libraries.iter().map(|l| &**l), &self.locales);

        for app in &self.applications {
            let name = app.name();
            let roots = app.required_classes(&known);
            let order = self.analyser.load_order(&roots);
            let classes: BTreeSet<String> = order.iter().cloned().collect();
            let module_mtimes = app.local_module_mtimes(&self.project_dir);

            let skip = {
                let state = self.state.lock();
                state.generated.contains(&name)
                    && !classes.iter().any(|c| recently_compiled.contains(c))
                    && state.module_mtimes.get(&name) == Some(&module_mtimes)
            };
            {
                let mut state = self.state.lock();
                state.app_classes.insert(name.clone(), classes);
            }
            if skip {
                tracing::debug!(application = %name, "application unchanged, skipping");
                continue;
            }

            self.events.emit(CompilerEvent::WritingApplication {
                application: name.clone(),
                target: self.target.name().to_string(),
            });

            let (parts, mut packages) = partition(&order, &app.parts);
            let mut bundle_resources = BTreeMap::new();
            for package in &mut packages {
                let mut asset_patterns = Vec::new();
                let mut msgids = BTreeSet::new();
                for classname in &package.classes {
                    if let Some(info) = self.analyser.class_info(classname) {
                        asset_patterns.extend(info.assets.iter().cloned());
                        msgids.extend(info.translations.iter().cloned());
                    }
                }
                package.assets = resources.select(&asset_patterns);
                for asset in &package.assets {
                    if let Some(path) = resources.get(asset) {
                        bundle_resources.insert(asset.clone(), path.clone());
                    }
                }
                for (locale, catalog) in &translations {
                    package
                        .translations
                        .insert(locale.clone(), catalog.select(&msgids));
                }
            }
            if let Some(boot) = parts.iter().find(|p| p.name == BOOT_PART) {
                for id in &boot.packages {
                    for locale in &self.locales {
                        packages[*id].locales.insert(locale.clone(), locale_data(locale));
                    }
                }
            }

            let bundle = ApplicationBundle {
                application: app.clone(),
                parts,
                packages,
                environment: self.analyser.environment().clone(),
                resources: bundle_resources,
                project_dir: self.project_dir.clone(),
            };
            self.target.generate(&bundle)?;

            {
                let mut state = self.state.lock();
                state.generated.insert(name.clone());
                state.module_mtimes.insert(name.clone(), module_mtimes);
            }
            self.events.emit(CompilerEvent::WrittenApplication {
                application: name.clone(),
                target: self.target.name().to_string(),
            });
            outcome.applications_built.push(name);
        }

        tracing::info!(
            target = %self.target.name(),
            success = outcome.success,
            built = outcome.applications_built.len(),
            "make finished"
        );
        Ok(outcome)
    }

    fn erase_output(&self) -> Result<(), MakerError> {
        let out = self.target.output_dir();
        tracing::info!(output = %out.display(), "build context changed, erasing output");
        let mut doomed = vec![out.join(TRANSPILED_DIR), out.join(RESOURCE_DIR)];
        doomed.extend(self.applications.iter().map(|a| out.join(a.name())));
        for dir in doomed {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(MakerError::io(dir, e)),
            }
        }
        let db = out.join(BUILD_DB_FILE);
        match fs::remove_file(&db) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MakerError::io(db, e)),
        }
    }
}

fn locale_data(locale: &str) -> serde_json::Value {
    let language = locale.split(['_', '-']).next().unwrap_or(locale);
    serde_json::json!({ "locale": locale, "language": language })
}

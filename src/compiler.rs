//! Compiler
//!
//! One compiler run: load libraries, bring the metadata database up to date
//! with what discovery finds on disk, build every selected target once and,
//! in watch mode, keep recompiling until stopped. When a server command is
//! configured the whole run is delegated to that process instead.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::analyser::Analyser;
use crate::backend::{CompileBackend, InlineBackend, PoolBackend};
use crate::config::CompilerConfig;
use crate::controller::{Controller, MakeResult};
use crate::discovery::Discovery;
use crate::error::{CompilerError, ConfigurationError};
use crate::events::EventBus;
use crate::library::LibraryRegistry;
use crate::maker::Maker;
use crate::marker::CompileMarker;
use crate::meta_db::MetaDatabase;
use crate::pool::TranspilerPool;
use crate::server::RemoteCompiler;
use crate::target::TargetRegistry;
use crate::transformer::TransformerRegistry;

/// Result of a whole run, summed over every target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub had_warnings: bool,
    pub applications_built: Vec<String>,
    pub markers: Vec<CompileMarker>,
}

impl RunOutcome {
    fn absorb(&mut self, results: Vec<MakeResult>, fail_on_warnings: bool) {
        for result in results {
            match result {
                Ok(outcome) => {
                    self.success &= outcome.success;
                    self.had_warnings |= outcome.had_warnings;
                    self.applications_built.extend(outcome.applications_built);
                    self.markers.extend(outcome.markers);
                }
                Err(e) => {
                    tracing::error!(error = %e, "make failed");
                    self.success = false;
                }
            }
        }
        if fail_on_warnings && self.had_warnings {
            self.success = false;
        }
    }
}

pub struct Compiler {
    config: CompilerConfig,
    events: EventBus,
    targets: TargetRegistry,
    transformers: TransformerRegistry,
    stop: Arc<Notify>,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            targets: TargetRegistry::default(),
            transformers: TransformerRegistry::default(),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn with_registries(mut self, targets: TargetRegistry, transformers: TransformerRegistry) -> Self {
        self.targets = targets;
        self.transformers = transformers;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Ends a watching run after its current event. A stop requested before
    /// watching starts is remembered.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    pub async fn run(&self) -> Result<RunOutcome, CompilerError> {
        if let Some(server) = &self.config.server {
            let mut config = self.config.clone();
            config.server = None;
            let remote = RemoteCompiler::spawn(&server.command, &self.config.project_dir)?;
            let result = remote.compile(&config, &self.events).await;
            remote.shutdown().await;
            return result;
        }
        self.run_local().await
    }

    async fn run_local(&self) -> Result<RunOutcome, CompilerError> {
        let config = &self.config;
        config.validate()?;

        let libraries = Arc::new(self.load_libraries()?);

        let mut meta = MetaDatabase::new(&config.meta_dir);
        meta.load()?;
        meta.add_environment_checks(libraries.environment_checks());

        let mut discovery = Discovery::new();
        for library in libraries.iter() {
            if library.class_path.is_dir() {
                discovery.add_root(&library.class_path)?;
            } else {
                tracing::warn!(library = %library.namespace, path = %library.class_path.display(), "library has no class directory");
            }
        }
        discovery.start(config.watch)?;
        let classes: BTreeMap<String, PathBuf> = discovery.classes().into_iter().collect();
        sync_meta(&mut meta, &classes)?;

        let transformer = self
            .transformers
            .get(&config.transformer)
            .map_err(ConfigurationError::from)?;
        let pool = match config.workers {
            Some(0) => None,
            size => Some(Arc::new(TranspilerPool::new(
                size,
                transformer.clone(),
                self.events.clone(),
            )?)),
        };
        let backend: Arc<dyn CompileBackend> = match &pool {
            Some(pool) => Arc::new(PoolBackend::new(pool.clone())),
            None => Arc::new(InlineBackend::new(transformer)),
        };

        let mut makers = Vec::new();
        for target_config in config.selected_targets() {
            let target = self
                .targets
                .create(target_config)
                .map_err(ConfigurationError::from)?;
            let analyser = Analyser::new(
                target.name(),
                target.output_dir(),
                target.minify(),
                target.environment().clone(),
                libraries.versions(),
            );
            makers.push(Arc::new(Maker::new(
                target,
                analyser,
                config.applications.clone(),
                libraries.clone(),
                config.locales.clone(),
                config.project_dir.clone(),
                config.no_erase,
                self.events.clone(),
            )));
        }

        let controller = Controller::new(meta, classes, backend, makers, self.events.clone());
        let mut outcome = RunOutcome {
            success: true,
            ..RunOutcome::default()
        };
        outcome.absorb(controller.make_all().await, config.fail_on_warnings);
        tracing::info!(
            success = outcome.success,
            warnings = outcome.had_warnings,
            applications = outcome.applications_built.len(),
            "initial make finished"
        );

        let watched = if config.watch {
            self.watch(&controller, &mut discovery).await
        } else {
            Ok(())
        };
        discovery.stop();
        if let Some(pool) = pool {
            pool.shutdown();
        }
        watched.map(|()| outcome)
    }

    fn load_libraries(&self) -> Result<LibraryRegistry, CompilerError> {
        let mut libraries = LibraryRegistry::new();
        for dir in &self.config.libraries {
            libraries.load(dir)?;
        }
        let mismatches = libraries.check_requirements()?;
        if !mismatches.is_empty() {
            if self.config.strict_versions {
                return Err(CompilerError::DependencyVersions(mismatches));
            }
            for mismatch in &mismatches {
                tracing::warn!("{}", mismatch);
            }
        }
        Ok(libraries)
    }

    async fn watch(&self, controller: &Controller, discovery: &mut Discovery) -> Result<(), CompilerError> {
        let Some(mut events) = discovery.take_events() else {
            return Ok(());
        };
        controller.set_auto_make(true);
        tracing::info!("watching for changes");
        let result = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(Ok(event)) => controller.handle_discovery_event(event).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "file watching failed");
                        break Err(CompilerError::from(e));
                    }
                    None => break Ok(()),
                },
                _ = self.stop.notified() => break Ok(()),
                _ = tokio::signal::ctrl_c() => break Ok(()),
            }
        };
        controller.set_auto_make(false);
        tracing::info!("stopped watching");
        result
    }
}

/// Bring the metadata database in line with the classes on disk: parse new
/// and changed files, drop records whose source is gone, reconcile and save.
fn sync_meta(meta: &mut MetaDatabase, classes: &BTreeMap<String, PathBuf>) -> Result<(), CompilerError> {
    let stale: Vec<PathBuf> = meta
        .classnames()
        .filter(|c| !classes.contains_key(*c))
        .filter_map(|c| meta.get_meta_data(c))
        .map(|record| PathBuf::from(&record.source_filename))
        .collect();
    for path in stale {
        if let Err(e) = meta.remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "cannot drop stale record");
        }
    }

    let files: Vec<(Option<String>, PathBuf)> = classes
        .iter()
        .map(|(classname, path)| (Some(classname.clone()), path.clone()))
        .collect();
    let parsed: BTreeSet<String> = meta.add_files(&files, false).into_iter().collect();
    let reconciled = meta.reparse_all()?;
    for warning in meta.take_warnings() {
        tracing::warn!(classname = %warning.classname, "{}", warning.message);
    }
    meta.save()?;
    tracing::info!(
        classes = classes.len(),
        parsed = parsed.len(),
        reconciled = reconciled.len(),
        "metadata up to date"
    );
    Ok(())
}

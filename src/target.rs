//! Targets
//!
//! A target decides what an application looks like on disk. The source
//! target points the loader at each transpiled class file; the build target
//! concatenates minified class code into one file per package and copies
//! assets next to it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::application::Application;
use crate::class_compiler::{transpiled_path, TRANSPILED_DIR};
use crate::error::{MakerError, NotFoundError};
use crate::package::{Package, Part};

pub const RESOURCE_DIR: &str = "resource";
pub const MODULES_DIR: &str = "modules";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: String,
    pub output_path: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
    /// Defaults to the target type: build targets minify.
    #[serde(default)]
    pub minify: Option<bool>,
}

/// Everything a target needs to write one application.
#[derive(Debug, Clone)]
pub struct ApplicationBundle {
    pub application: Application,
    pub parts: Vec<Part>,
    pub packages: Vec<Package>,
    pub environment: BTreeMap<String, Value>,
    /// Resource id → file, for every asset any package uses.
    pub resources: BTreeMap<String, PathBuf>,
    /// Directory that local module paths are relative to.
    pub project_dir: PathBuf,
}

pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    fn output_dir(&self) -> &Path;

    fn minify(&self) -> bool;

    fn embed_all_js(&self) -> bool;

    fn environment(&self) -> &BTreeMap<String, Value>;

    fn generate(&self, bundle: &ApplicationBundle) -> Result<(), MakerError>;

    fn application_dir(&self, application: &Application) -> PathBuf {
        self.output_dir().join(application.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SourceTarget {
    config: TargetConfig,
}

impl SourceTarget {
    pub fn new(config: TargetConfig) -> Self {
        Self { config }
    }
}

impl Target for SourceTarget {
    fn name(&self) -> &str {
        "source"
    }

    fn output_dir(&self) -> &Path {
        &self.config.output_path
    }

    fn minify(&self) -> bool {
        self.config.minify.unwrap_or(false)
    }

    fn embed_all_js(&self) -> bool {
        false
    }

    fn environment(&self) -> &BTreeMap<String, Value> {
        &self.config.environment
    }

    fn generate(&self, bundle: &ApplicationBundle) -> Result<(), MakerError> {
        let app_dir = self.application_dir(&bundle.application);
        let packages = bundle
            .packages
            .iter()
            .map(|package| {
                let uris = package
                    .classes
                    .iter()
                    .map(|c| relative_class_uri(c))
                    .collect();
                (package.id.to_string(), package_entry(package, uris, false))
            })
            .collect();
        let resources = bundle
            .resources
            .iter()
            .map(|(id, path)| (id.clone(), path.to_string_lossy().to_string()))
            .collect();
        write_application(&app_dir, bundle, packages, resources)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BuildTarget {
    config: TargetConfig,
}

impl BuildTarget {
    pub fn new(config: TargetConfig) -> Self {
        Self { config }
    }
}

impl Target for BuildTarget {
    fn name(&self) -> &str {
        "build"
    }

    fn output_dir(&self) -> &Path {
        &self.config.output_path
    }

    fn minify(&self) -> bool {
        self.config.minify.unwrap_or(true)
    }

    fn embed_all_js(&self) -> bool {
        true
    }

    fn environment(&self) -> &BTreeMap<String, Value> {
        &self.config.environment
    }

    fn generate(&self, bundle: &ApplicationBundle) -> Result<(), MakerError> {
        let app_dir = self.application_dir(&bundle.application);
        let mut packages = BTreeMap::new();
        for package in &bundle.packages {
            let empty = package.is_empty(true);
            let mut uris = Vec::new();
            if !package.classes.is_empty() {
                let file = format!("package-{}.js", package.id);
                let mut code = String::new();
                for classname in &package.classes {
                    let path = transpiled_path(self.output_dir(), classname, "js");
                    let source = fs::read_to_string(&path).map_err(|e| MakerError::io(&path, e))?;
                    code.push_str(strip_source_map_comment(&source));
                    code.push('\n');
                }
                write_file(&app_dir.join(&file), &code)?;
                uris.push(file);
            }
            packages.insert(package.id.to_string(), package_entry(package, uris, empty));
        }

        let resource_dir = self.output_dir().join(RESOURCE_DIR);
        let mut resources = BTreeMap::new();
        for (id, source) in &bundle.resources {
            let dest = resource_dir.join(id);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| MakerError::io(parent, e))?;
            }
            fs::copy(source, &dest).map_err(|e| MakerError::io(source, e))?;
            resources.insert(id.clone(), format!("../{}/{}", RESOURCE_DIR, id));
        }
        write_application(&app_dir, bundle, packages, resources)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

pub type TargetFactory = fn(TargetConfig) -> Arc<dyn Target>;

#[derive(Clone)]
pub struct TargetRegistry {
    factories: BTreeMap<String, TargetFactory>,
}

impl TargetRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: TargetFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, config: TargetConfig) -> Result<Arc<dyn Target>, NotFoundError> {
        let factory = self
            .factories
            .get(&config.target_type)
            .ok_or_else(|| NotFoundError::new("target", &config.target_type))?;
        Ok(factory(config))
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("source", |config| -> Arc<dyn Target> {
            Arc::new(SourceTarget::new(config))
        });
        registry.register("build", |config| -> Arc<dyn Target> {
            Arc::new(BuildTarget::new(config))
        });
        registry
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOADER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageEntry {
    uris: Vec<String>,
    empty: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    locales: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    translations: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    assets: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoaderConfig<'a> {
    application: String,
    main_class: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    theme: Option<&'a str>,
    environment: &'a BTreeMap<String, Value>,
    boot: &'static str,
    parts: BTreeMap<&'a str, &'a [usize]>,
    packages: BTreeMap<String, PackageEntry>,
    resources: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    modules: BTreeMap<String, String>,
}

const LOADER_SCRIPT: &str = r#"(function () {
  var loader = qx.$$loader;
  var part = loader.parts[loader.boot];
  var uris = [];
  part.forEach(function (id) {
    uris = uris.concat(loader.packages[id].uris);
  });
  function next() {
    var uri = uris.shift();
    if (!uri) {
      return;
    }
    var script = document.createElement("script");
    script.src = uri;
    script.onload = next;
    document.head.appendChild(script);
  }
  next();
})();
"#;

fn package_entry(package: &Package, uris: Vec<String>, empty: bool) -> PackageEntry {
    PackageEntry {
        uris,
        empty,
        locales: package.locales.clone(),
        translations: package.translations.clone(),
        assets: package.assets.iter().cloned().collect(),
    }
}

fn write_application(
    app_dir: &Path,
    bundle: &ApplicationBundle,
    packages: BTreeMap<String, PackageEntry>,
    resources: BTreeMap<String, String>,
) -> Result<(), MakerError> {
    let application = &bundle.application;
    let mut modules = BTreeMap::new();
    for (name, source) in &application.local_modules {
        let source = bundle.project_dir.join(source);
        let file = format!("{}/{}.js", MODULES_DIR, name);
        let dest = app_dir.join(&file);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| MakerError::io(parent, e))?;
        }
        fs::copy(&source, &dest).map_err(|e| MakerError::io(&source, e))?;
        modules.insert(name.clone(), file);
    }

    let config = LoaderConfig {
        application: application.name(),
        main_class: &application.class,
        theme: application.theme.as_deref(),
        environment: &bundle.environment,
        boot: crate::application::BOOT_PART,
        parts: bundle
            .parts
            .iter()
            .map(|p| (p.name.as_str(), p.packages.as_slice()))
            .collect(),
        packages,
        resources,
        modules,
    };
    let json = serde_json::to_string_pretty(&config).map_err(|e| MakerError::Serialize {
        what: format!("loader of {}", application.name()),
        source: e,
    })?;
    let index_js = format!(
        "var qx = window.qx || (window.qx = {{}});\nqx.$$loader = {};\n{}",
        json, LOADER_SCRIPT
    );
    write_file(&app_dir.join("index.js"), &index_js)?;

    let title = application.title.clone().unwrap_or_else(|| application.name());
    let index_html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<script src=\"index.js\"></script>\n</head>\n<body></body>\n</html>\n",
        title
    );
    write_file(&app_dir.join("index.html"), &index_html)
}

/// URI of a transpiled class as seen from an application directory.
fn relative_class_uri(classname: &str) -> String {
    format!("../{}/{}.js", TRANSPILED_DIR, classname.replace('.', "/"))
}

fn strip_source_map_comment(code: &str) -> &str {
    match code.rfind("//# sourceMappingURL=") {
        Some(pos) => code[..pos].trim_end(),
        None => code.trim_end(),
    }
}

pub(crate) fn write_file(path: &Path, data: &str) -> Result<(), MakerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MakerError::io(parent, e))?;
    }
    fs::write(path, data).map_err(|e| MakerError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::partition;

    fn bundle(project: &Path) -> ApplicationBundle {
        let order = vec!["qx.core.Object".to_string(), "app.Main".to_string()];
        let (parts, mut packages) = partition(&order, &[]);
        packages[0].assets.insert("app/logo.png".into());
        let logo = project.join("logo.png");
        fs::write(&logo, b"png").unwrap();
        ApplicationBundle {
            application: Application::new("app.Main"),
            parts,
            packages,
            environment: BTreeMap::from([("qx.debug".to_string(), Value::Bool(true))]),
            resources: BTreeMap::from([("app/logo.png".to_string(), logo)]),
            project_dir: project.to_path_buf(),
        }
    }

    fn config(kind: &str, out: &Path) -> TargetConfig {
        TargetConfig {
            target_type: kind.into(),
            output_path: out.to_path_buf(),
            environment: BTreeMap::new(),
            minify: None,
        }
    }

    #[test]
    fn test_registry() {
        let registry = TargetRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let source = registry.create(config("source", dir.path())).unwrap();
        assert_eq!(source.name(), "source");
        assert!(!source.minify());
        assert!(registry.create(config("hybrid", dir.path())).is_err());
    }

    #[test]
    fn test_source_target_points_at_transpiled_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = SourceTarget::new(config("source", &dir.path().join("out")));
        target.generate(&bundle(dir.path())).unwrap();

        let index = fs::read_to_string(dir.path().join("out/main/index.js")).unwrap();
        assert!(index.contains("../transpiled/app/Main.js"));
        assert!(index.contains("\"mainClass\": \"app.Main\""));
        assert!(dir.path().join("out/main/index.html").is_file());
    }

    #[test]
    fn test_build_target_concatenates_and_copies_assets() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        for (classname, code) in [("qx.core.Object", "var a = 1;"), ("app.Main", "var b = 2;")] {
            let path = transpiled_path(&out, classname, "js");
            write_file(&path, &format!("{}\n\n//# sourceMappingURL=x.js.map\n", code)).unwrap();
        }

        let target = BuildTarget::new(config("build", &out));
        assert!(target.minify());
        target.generate(&bundle(dir.path())).unwrap();

        let package = fs::read_to_string(out.join("main/package-0.js")).unwrap();
        assert_eq!(package, "var a = 1;\nvar b = 2;\n");
        assert!(out.join("resource/app/logo.png").is_file());
    }
}

//! Libraries and their `Manifest.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ConfigurationError, DependencyVersionError, NotFoundError};

pub const MANIFEST_FILE: &str = "Manifest.json";

// ═══════════════════════════════════════════════════════════════════════════════
// MANIFEST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestProvides {
    pub namespace: String,
    #[serde(default = "default_class_path")]
    pub class: String,
    #[serde(default = "default_resource_path")]
    pub resource: String,
    #[serde(default = "default_translation_path")]
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_checks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub info: ManifestInfo,
    pub provides: ManifestProvides,
    /// Library name or namespace → semver range.
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_class_path() -> String {
    "source/class".to_string()
}

fn default_resource_path() -> String {
    "source/resource".to_string()
}

fn default_translation_path() -> String {
    "source/translation".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIBRARY
// ═══════════════════════════════════════════════════════════════════════════════

/// A loaded library. Immutable once its manifest has been read.
#[derive(Debug, Clone)]
pub struct Library {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub root_dir: PathBuf,
    pub class_path: PathBuf,
    pub resource_path: PathBuf,
    pub translation_path: PathBuf,
    pub theme_path: Option<PathBuf>,
    pub requires: BTreeMap<String, String>,
    pub environment_checks: BTreeMap<String, String>,
}

impl Library {
    pub fn from_directory(dir: &Path) -> Result<Library, ConfigurationError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let data = fs::read_to_string(&manifest_path)
            .map_err(|_| ConfigurationError::MissingManifest(dir.to_path_buf()))?;
        let manifest: Manifest =
            serde_json::from_str(&data).map_err(|e| ConfigurationError::InvalidManifest {
                path: manifest_path.clone(),
                message: e.to_string(),
            })?;
        if manifest.provides.namespace.is_empty() {
            return Err(ConfigurationError::InvalidManifest {
                path: manifest_path,
                message: "provides.namespace is empty".to_string(),
            });
        }
        Ok(Library::from_manifest(dir, manifest))
    }

    pub fn from_manifest(dir: &Path, manifest: Manifest) -> Library {
        let Manifest {
            info,
            provides,
            requires,
        } = manifest;
        Library {
            namespace: provides.namespace,
            name: info.name,
            version: info.version,
            root_dir: dir.to_path_buf(),
            class_path: dir.join(provides.class),
            resource_path: dir.join(provides.resource),
            translation_path: dir.join(provides.translation),
            theme_path: provides.theme.map(|t| dir.join(t)),
            requires,
            environment_checks: provides.environment_checks,
        }
    }

    /// Expected source file of `classname` inside this library.
    pub fn class_file(&self, classname: &str) -> PathBuf {
        let mut path = self.class_path.clone();
        for segment in classname.split('.') {
            path.push(segment);
        }
        path.set_extension("js");
        path
    }

    pub fn owns_classname(&self, classname: &str) -> bool {
        classname == self.namespace
            || classname
                .strip_prefix(self.namespace.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Libraries of one compiler run, loaded once and keyed by namespace.
#[derive(Debug, Clone, Default)]
pub struct LibraryRegistry {
    libraries: BTreeMap<String, Arc<Library>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the library rooted at `dir`, or return the cached one.
    pub fn load(&mut self, dir: &Path) -> Result<Arc<Library>, ConfigurationError> {
        if let Some(existing) = self.libraries.values().find(|l| l.root_dir == dir) {
            return Ok(existing.clone());
        }
        let library = Library::from_directory(dir)?;
        self.add(library)
    }

    pub fn add(&mut self, library: Library) -> Result<Arc<Library>, ConfigurationError> {
        if self.libraries.contains_key(&library.namespace) {
            return Err(ConfigurationError::DuplicateNamespace(library.namespace));
        }
        tracing::info!(namespace = %library.namespace, version = %library.version, "loaded library");
        let library = Arc::new(library);
        self.libraries
            .insert(library.namespace.clone(), library.clone());
        Ok(library)
    }

    pub fn get(&self, namespace: &str) -> Result<&Arc<Library>, NotFoundError> {
        self.libraries
            .get(namespace)
            .ok_or_else(|| NotFoundError::new("library", namespace))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Library>> {
        self.libraries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    /// The library with the longest namespace that prefixes `classname`.
    pub fn library_for_class(&self, classname: &str) -> Option<&Arc<Library>> {
        self.libraries
            .values()
            .filter(|l| l.owns_classname(classname))
            .max_by_key(|l| l.namespace.len())
    }

    /// Source file of `classname` if a library provides it on disk.
    pub fn find_class_file(&self, classname: &str) -> Option<PathBuf> {
        let library = self.library_for_class(classname)?;
        let path = library.class_file(classname);
        path.is_file().then_some(path)
    }

    /// Namespace → version, the library part of the build fingerprint.
    pub fn versions(&self) -> BTreeMap<String, String> {
        self.libraries
            .iter()
            .map(|(ns, l)| (ns.clone(), l.version.clone()))
            .collect()
    }

    pub fn environment_checks(&self) -> BTreeMap<String, String> {
        self.libraries
            .values()
            .flat_map(|l| l.environment_checks.clone())
            .collect()
    }

    /// Check every declared requirement. A required library that is not
    /// loaded is fatal; version mismatches are returned for the caller to
    /// report or escalate.
    pub fn check_requirements(&self) -> Result<Vec<DependencyVersionError>, ConfigurationError> {
        let mut mismatches = Vec::new();
        for library in self.libraries.values() {
            for (required, range) in &library.requires {
                let Some(target) = self
                    .libraries
                    .values()
                    .find(|l| &l.name == required || &l.namespace == required)
                else {
                    return Err(ConfigurationError::UnresolvedLibrary {
                        library: required.clone(),
                        required_by: library.namespace.clone(),
                    });
                };
                if !version_satisfies(&target.version, range) {
                    mismatches.push(DependencyVersionError {
                        library: required.clone(),
                        required_by: library.namespace.clone(),
                        requirement: range.clone(),
                        actual: target.version.clone(),
                    });
                }
            }
        }
        Ok(mismatches)
    }
}

fn version_satisfies(version: &str, range: &str) -> bool {
    let (Ok(version), Ok(requirement)) = (
        semver::Version::parse(version),
        semver::VersionReq::parse(range),
    ) else {
        tracing::warn!(version, range, "unparseable version requirement");
        return false;
    };
    requirement.matches(&version)
}

//! Compiler configuration (`compile.json`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::application::Application;
use crate::error::ConfigurationError;
use crate::target::TargetConfig;

pub const CONFIG_FILE: &str = "compile.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Program and arguments of an out-of-process compiler server.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompilerConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Only build this target type; all targets when unset.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub applications: Vec<Application>,
    /// Library directories, each holding a `Manifest.json`.
    #[serde(default = "default_libraries")]
    pub libraries: Vec<PathBuf>,
    /// Environment shared by every target; target settings win.
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
    #[serde(default = "default_locales")]
    pub locales: Vec<String>,
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
    #[serde(default = "default_transformer")]
    pub transformer: String,
    /// Worker threads; 0 compiles inline, unset sizes by CPU count.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub fail_on_warnings: bool,
    /// Treat library version mismatches as fatal.
    #[serde(default)]
    pub strict_versions: bool,
    /// Keep output even when the build context changed.
    #[serde(default)]
    pub no_erase: bool,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

fn default_libraries() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

fn default_locales() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("compiled/meta")
}

fn default_transformer() -> String {
    "oxc".to_string()
}

impl CompilerConfig {
    /// Read and validate `compile.json`. Relative paths become relative to
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let unreadable = |message: String| ConfigurationError::Unreadable {
            path: path.to_path_buf(),
            message,
        };
        let data = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let mut config: CompilerConfig =
            serde_json::from_str(&data).map_err(|e| unreadable(e.to_string()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: Value, project_dir: &Path) -> Result<Self, ConfigurationError> {
        let mut config: CompilerConfig =
            serde_json::from_value(json).map_err(|e| ConfigurationError::Unreadable {
                path: project_dir.join(CONFIG_FILE),
                message: e.to_string(),
            })?;
        config.resolve_paths(project_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.project_dir = base.to_path_buf();
        for library in &mut self.libraries {
            *library = base.join(&*library);
        }
        for target in &mut self.targets {
            if !target.output_path.as_os_str().is_empty() {
                target.output_path = base.join(&target.output_path);
            }
        }
        self.meta_dir = base.join(&self.meta_dir);
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.targets.is_empty() {
            return Err(ConfigurationError::NoTargets);
        }
        for target in &self.targets {
            if target.output_path.as_os_str().is_empty() {
                return Err(ConfigurationError::MissingOutputPath(target.target_type.clone()));
            }
        }

        let mut names = BTreeSet::new();
        let mut default: Option<String> = None;
        for app in &self.applications {
            if app.class.is_empty() {
                return Err(ConfigurationError::MissingApplicationClass(app.name()));
            }
            let name = app.name();
            if !names.insert(name.clone()) {
                return Err(ConfigurationError::DuplicateApplication(name));
            }
            if app.default {
                if let Some(previous) = default.replace(name.clone()) {
                    return Err(ConfigurationError::DuplicateDefaultApplication(previous, name));
                }
            }
        }
        Ok(())
    }

    /// Targets selected by `target`, each with the shared environment merged
    /// under its own.
    pub fn selected_targets(&self) -> Vec<TargetConfig> {
        self.targets
            .iter()
            .filter(|t| self.target.as_ref().map_or(true, |wanted| &t.target_type == wanted))
            .map(|t| {
                let mut target = t.clone();
                let mut environment = self.environment.clone();
                environment.extend(t.environment.clone());
                target.environment = environment;
                target
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_and_paths() {
        let config = CompilerConfig::from_json(
            json!({
                "targets": [{ "type": "source", "outputPath": "compiled/source", "environment": { "b": 2 } }],
                "applications": [{ "class": "app.Application" }],
                "environment": { "a": 1, "b": 1 }
            }),
            Path::new("/project"),
        )
        .unwrap();
        assert_eq!(config.libraries, vec![PathBuf::from("/project/.")]);
        assert_eq!(config.meta_dir, PathBuf::from("/project/compiled/meta"));
        assert_eq!(config.locales, vec!["en"]);
        assert_eq!(config.transformer, "oxc");

        let targets = config.selected_targets();
        assert_eq!(targets[0].output_path, PathBuf::from("/project/compiled/source"));
        assert_eq!(targets[0].environment["a"], 1);
        assert_eq!(targets[0].environment["b"], 2);
    }

    #[test]
    fn test_validation_errors() {
        let project = Path::new("/project");
        assert!(matches!(
            CompilerConfig::from_json(json!({ "targets": [] }), project),
            Err(ConfigurationError::NoTargets)
        ));
        assert!(matches!(
            CompilerConfig::from_json(json!({ "targets": [{ "type": "build", "outputPath": "" }] }), project),
            Err(ConfigurationError::MissingOutputPath(_))
        ));
        assert!(matches!(
            CompilerConfig::from_json(
                json!({
                    "targets": [{ "type": "source", "outputPath": "out" }],
                    "applications": [
                        { "class": "app.A", "default": true },
                        { "class": "app.B", "default": true }
                    ]
                }),
                project
            ),
            Err(ConfigurationError::DuplicateDefaultApplication(a, b)) if a == "a" && b == "b"
        ));
        assert!(matches!(
            CompilerConfig::from_json(
                json!({
                    "targets": [{ "type": "source", "outputPath": "out" }],
                    "applications": [{ "class": "app.A" }, { "class": "other.A" }]
                }),
                project
            ),
            Err(ConfigurationError::DuplicateApplication(_))
        ));
    }

    #[test]
    fn test_target_selection() {
        let config = CompilerConfig::from_json(
            json!({
                "targets": [
                    { "type": "source", "outputPath": "out/source" },
                    { "type": "build", "outputPath": "out/build" }
                ],
                "target": "build"
            }),
            Path::new("/p"),
        )
        .unwrap();
        let targets = config.selected_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target_type, "build");
    }
}

//! Applications: the root classes a target bundles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::class_meta::mtime_millis;

pub const BOOT_PART: &str = "boot";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartConfig {
    pub name: String,
    /// Class patterns this part claims, e.g. `app.admin.*`.
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// The main class.
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub parts: Vec<PartConfig>,
    #[serde(default)]
    pub default: bool,
    /// Module name → file, shipped next to the application unchanged.
    #[serde(default)]
    pub local_modules: BTreeMap<String, PathBuf>,
}

impl Application {
    pub fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            name: None,
            theme: None,
            title: None,
            include: Vec::new(),
            exclude: Vec::new(),
            parts: Vec::new(),
            default: false,
            local_modules: BTreeMap::new(),
        }
    }

    /// Explicit name, or the main class's last segment in lower case.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.class
                .rsplit('.')
                .next()
                .unwrap_or(&self.class)
                .to_lowercase()
        })
    }

    /// Root classes: main class, theme, and every known class matched by
    /// `include`, minus `exclude`.
    pub fn required_classes<'a>(&self, known: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut required = BTreeSet::new();
        required.insert(self.class.clone());
        if let Some(theme) = &self.theme {
            required.insert(theme.clone());
        }
        let known: Vec<&String> = known.into_iter().collect();
        for pattern in &self.include {
            if pattern.contains('*') {
                required.extend(
                    known
                        .iter()
                        .filter(|c| class_pattern_matches(pattern, c))
                        .map(|c| (*c).clone()),
                );
            } else {
                required.insert(pattern.clone());
            }
        }
        required
            .into_iter()
            .filter(|c| c == &self.class || !self.is_excluded(c))
            .collect()
    }

    pub fn is_excluded(&self, classname: &str) -> bool {
        self.exclude.iter().any(|p| class_pattern_matches(p, classname))
    }

    /// Whether a change to `classname` affects this application, given the
    /// classes its target resolved for it.
    pub fn depends_on_class(&self, classname: &str, resolved: &BTreeSet<String>) -> bool {
        self.class == classname
            || self.theme.as_deref() == Some(classname)
            || resolved.contains(classname)
    }

    /// Modification times of the local modules, relative to `base`. Missing
    /// files are recorded as 0 so that their appearance counts as a change.
    pub fn local_module_mtimes(&self, base: &Path) -> BTreeMap<String, u64> {
        self.local_modules
            .iter()
            .map(|(name, path)| (name.clone(), mtime_millis(&base.join(path)).unwrap_or(0)))
            .collect()
    }
}

/// `app.ui.*` matches everything below `app.ui`; other patterns match the
/// class itself and its nested names.
pub fn class_pattern_matches(pattern: &str, classname: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => classname.starts_with(prefix),
        None => {
            classname == pattern
                || classname
                    .strip_prefix(pattern)
                    .is_some_and(|rest| rest.starts_with('.'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_classes() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "class": "app.Application",
            "theme": "app.theme.Theme",
            "include": ["app.plugins.*", "app.Extra"],
            "exclude": ["app.plugins.Old"]
        }))
        .unwrap();
        let known: Vec<String> = ["app.plugins.Chart", "app.plugins.Old", "app.Other"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            app.required_classes(&known),
            vec!["app.Application", "app.Extra", "app.plugins.Chart", "app.theme.Theme"]
        );
        assert_eq!(app.name(), "application");
    }

    #[test]
    fn test_depends_on_theme() {
        let mut app = Application::new("app.Main");
        app.theme = Some("app.Theme".into());
        let resolved = BTreeSet::from(["qx.core.Object".to_string()]);
        assert!(app.depends_on_class("app.Theme", &resolved));
        assert!(app.depends_on_class("qx.core.Object", &resolved));
        assert!(!app.depends_on_class("app.Helper", &resolved));
    }

    #[test]
    fn test_class_patterns() {
        assert!(class_pattern_matches("app.ui.*", "app.ui.Button"));
        assert!(class_pattern_matches("app.ui", "app.ui.Button"));
        assert!(!class_pattern_matches("app.ui", "app.uix.Button"));
        assert!(class_pattern_matches("app.Main", "app.Main"));
    }
}

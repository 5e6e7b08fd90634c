//! Library resources and `@asset` selection.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::library::Library;

/// Resource id (`app/icons/logo.png`) → file on disk.
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    resources: BTreeMap<String, PathBuf>,
}

impl ResourceIndex {
    /// Scan each library's resource tree. A resource id provided by two
    /// libraries resolves to the first.
    pub fn scan<'a>(libraries: impl IntoIterator<Item = &'a Library>) -> Self {
        let mut resources = BTreeMap::new();
        for library in libraries {
            let root = &library.resource_path;
            if !root.is_dir() {
                continue;
            }
            let mut found = 0usize;
            for entry in WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable resource");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(id) = resource_id(root, entry.path()) {
                    resources.entry(id).or_insert_with(|| entry.path().to_path_buf());
                    found += 1;
                }
            }
            tracing::debug!(namespace = %library.namespace, resources = found, "scanned resources");
        }
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PathBuf> {
        self.resources.get(id)
    }

    /// Resource ids matched by any of the `@asset` patterns.
    pub fn select<'a>(&self, patterns: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        let mut selected = BTreeSet::new();
        for pattern in patterns {
            match asset_pattern(pattern) {
                Some(regex) => selected.extend(
                    self.resources
                        .keys()
                        .filter(|id| regex.is_match(id))
                        .cloned(),
                ),
                None => {
                    if self.resources.contains_key(pattern.as_str()) {
                        selected.insert(pattern.clone());
                    } else {
                        tracing::debug!(asset = %pattern, "asset not found");
                    }
                }
            }
        }
        selected
    }
}

fn resource_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// `app/icons/*` style patterns; `None` for a literal id.
fn asset_pattern(pattern: &str) -> Option<Regex> {
    if !pattern.contains('*') {
        return None;
    }
    let source = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", source)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Manifest;
    use std::fs;

    fn library(dir: &Path, namespace: &str) -> Library {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "info": { "name": namespace },
            "provides": { "namespace": namespace }
        }))
        .unwrap();
        Library::from_manifest(dir, manifest)
    }

    fn write(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_and_select() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write(&a.path().join("source/resource/app/logo.png"));
        write(&a.path().join("source/resource/app/icons/up.png"));
        write(&a.path().join("source/resource/app/.hidden/x.png"));
        write(&b.path().join("source/resource/app/logo.png"));
        write(&b.path().join("source/resource/qx/static/blank.gif"));

        let libs = [library(a.path(), "app"), library(b.path(), "qx")];
        let index = ResourceIndex::scan(libs.iter());
        assert_eq!(index.len(), 3);
        assert_eq!(
            index.get("app/logo.png").unwrap(),
            &a.path().join("source/resource/app/logo.png")
        );

        let patterns = vec!["app/*".to_string(), "qx/static/blank.gif".to_string(), "nope.png".to_string()];
        let selected: Vec<String> = index.select(&patterns).into_iter().collect();
        assert_eq!(selected, vec!["app/icons/up.png", "app/logo.png", "qx/static/blank.gif"]);
    }
}

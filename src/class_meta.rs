//! Class metadata records and their per-class on-disk store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::MetaError;
use crate::jsdoc::JsDoc;

/// Bumped whenever the record layout changes; stored records with another
/// version are treated as absent.
pub const META_VERSION: f64 = 0.4;

// ═══════════════════════════════════════════════════════════════════════════════
// RECORD TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub start: SourceLocation,
    pub end: SourceLocation,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Public,
    Protected,
    Private,
}

impl Access {
    /// No leading underscore is public, one is protected, two is private.
    pub fn from_name(name: &str) -> Access {
        if name.starts_with("__") {
            Access::Private
        } else if name.starts_with('_') {
            Access::Protected
        } else {
            Access::Public
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ClassType {
    Class,
    Mixin,
    Interface,
    Theme,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MemberKind {
    #[default]
    Function,
    Variable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParamMeta {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReturnMeta {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberMeta {
    pub kind: MemberKind,
    pub access: Access,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<ReturnMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsdoc: Option<JsDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_abstract: bool,
    /// Set on placeholders synthesized for unimplemented interface members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_from: Option<String>,
    /// Set when the entry was merged in from one of the class's mixins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appears_in: Vec<String>,
}

impl MemberMeta {
    /// True when the entry was written by the class body itself rather than
    /// merged or synthesized during reconciliation.
    pub fn is_own(&self) -> bool {
        self.mixin.is_none() && self.from_interface.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refine: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub themeable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inheritable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsdoc: Option<JsDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overridden_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appears_in: Vec<String>,
}

impl PropertyMeta {
    pub fn is_own(&self) -> bool {
        self.mixin.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsdoc: Option<JsDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    pub version: f64,
    pub classname: String,
    #[serde(rename = "type")]
    pub class_type: ClassType,
    /// `abstract`, `static` or `singleton` when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub construct: Option<MemberMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destruct: Option<MemberMeta>,
    #[serde(default)]
    pub members: BTreeMap<String, MemberMeta>,
    #[serde(default)]
    pub statics: BTreeMap<String, MemberMeta>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyMeta>,
    #[serde(default)]
    pub events: BTreeMap<String, EventMeta>,
    /// Environment keys this class declares defaults for.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsdoc: Option<JsDoc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_defer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub source_filename: String,
    /// Source modification time in milliseconds since the epoch.
    pub last_modified: u64,
}

impl ClassRecord {
    pub fn new(classname: &str, class_type: ClassType) -> Self {
        Self {
            version: META_VERSION,
            classname: classname.to_string(),
            class_type,
            kind: None,
            super_class: None,
            mixins: Vec::new(),
            interfaces: Vec::new(),
            construct: None,
            destruct: None,
            members: BTreeMap::new(),
            statics: BTreeMap::new(),
            properties: BTreeMap::new(),
            events: BTreeMap::new(),
            environment: BTreeMap::new(),
            annotations: Vec::new(),
            jsdoc: None,
            has_defer: false,
            location: None,
            source_filename: String::new(),
            last_modified: 0,
        }
    }

    pub fn is_abstract(&self) -> bool {
        self.kind.as_deref() == Some("abstract")
    }

    pub fn package_name(&self) -> &str {
        match self.classname.rfind('.') {
            Some(pos) => &self.classname[..pos],
            None => "",
        }
    }

    /// Every class this record points at: superclass, mixins, interfaces.
    pub fn hierarchy_refs(&self) -> impl Iterator<Item = &String> {
        self.super_class
            .iter()
            .chain(self.mixins.iter())
            .chain(self.interfaces.iter())
    }
}

/// Modification time of `path` in milliseconds since the epoch.
pub fn mtime_millis(path: &Path) -> std::io::Result<u64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0))
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLASS META STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns one class's record and its `<classname-as-path>.json` file.
#[derive(Debug, Clone)]
pub struct ClassMetaStore {
    classname: String,
    meta_path: PathBuf,
    record: Option<ClassRecord>,
}

impl ClassMetaStore {
    pub fn new(root_dir: &Path, classname: &str) -> Self {
        Self {
            classname: classname.to_string(),
            meta_path: Self::meta_path(root_dir, classname),
            record: None,
        }
    }

    pub fn meta_path(root_dir: &Path, classname: &str) -> PathBuf {
        let mut path = root_dir.to_path_buf();
        for segment in classname.split('.') {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }

    pub fn classname(&self) -> &str {
        &self.classname
    }

    pub fn path(&self) -> &Path {
        &self.meta_path
    }

    pub fn record(&self) -> Option<&ClassRecord> {
        self.record.as_ref()
    }

    pub fn record_mut(&mut self) -> Option<&mut ClassRecord> {
        self.record.as_mut()
    }

    pub fn set_record(&mut self, record: ClassRecord) {
        self.record = Some(record);
    }

    /// Load the persisted record. Returns false when the file is missing or
    /// was written by another metadata version.
    pub fn load(&mut self) -> Result<bool, MetaError> {
        let data = match fs::read_to_string(&self.meta_path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(MetaError::Io {
                    path: self.meta_path.clone(),
                    source,
                })
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&data).map_err(|source| MetaError::Json {
                path: self.meta_path.clone(),
                source,
            })?;
        if value.get("version").and_then(|v| v.as_f64()) != Some(META_VERSION) {
            tracing::debug!(classname = %self.classname, "discarding metadata from another version");
            return Ok(false);
        }

        let record: ClassRecord =
            serde_json::from_value(value).map_err(|source| MetaError::Json {
                path: self.meta_path.clone(),
                source,
            })?;
        self.record = Some(record);
        Ok(true)
    }

    /// Persist the record. The file is only rewritten when its bytes differ.
    pub fn save(&self) -> Result<(), MetaError> {
        let Some(record) = &self.record else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(record).map_err(|source| MetaError::Json {
            path: self.meta_path.clone(),
            source,
        })?;
        write_if_changed(&self.meta_path, &data)
    }

    pub fn delete(&self) -> Result<(), MetaError> {
        match fs::remove_file(&self.meta_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MetaError::Io {
                path: self.meta_path.clone(),
                source,
            }),
        }
    }

    /// Stale when there is no record or the recorded source mtime differs.
    pub fn is_stale(&self, source_mtime: u64) -> bool {
        match &self.record {
            Some(record) => record.last_modified != source_mtime,
            None => true,
        }
    }
}

pub(crate) fn write_if_changed(path: &Path, data: &str) -> Result<(), MetaError> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == data {
            return Ok(());
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| MetaError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, data).map_err(|source| MetaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_from_name() {
        assert_eq!(Access::from_name("render"), Access::Public);
        assert_eq!(Access::from_name("_applyValue"), Access::Protected);
        assert_eq!(Access::from_name("__cache"), Access::Private);
    }

    #[test]
    fn test_meta_path_follows_classname() {
        let path = ClassMetaStore::meta_path(Path::new("/meta"), "app.ui.Button");
        assert_eq!(path, PathBuf::from("/meta/app/ui/Button.json"));
    }

    #[test]
    fn test_store_round_trip_and_version_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ClassMetaStore::new(dir.path(), "app.Main");
        let mut record = ClassRecord::new("app.Main", ClassType::Class);
        record.last_modified = 42;
        store.set_record(record);
        store.save().unwrap();

        let mut reloaded = ClassMetaStore::new(dir.path(), "app.Main");
        assert!(reloaded.load().unwrap());
        assert!(!reloaded.is_stale(42));
        assert!(reloaded.is_stale(43));

        let raw = fs::read_to_string(store.path()).unwrap();
        let bumped = raw.replace(&format!("\"version\": {}", META_VERSION), "\"version\": 0.1");
        fs::write(store.path(), bumped).unwrap();
        let mut outdated = ClassMetaStore::new(dir.path(), "app.Main");
        assert!(!outdated.load().unwrap());
        assert!(outdated.is_stale(42));
    }

    #[test]
    fn test_missing_store_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ClassMetaStore::new(dir.path(), "app.Nothing");
        assert!(!store.load().unwrap());
        assert!(store.record().is_none());
    }
}

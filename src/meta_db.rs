//! The metadata database.
//!
//! Aggregates one `ClassMetaStore` per class, reconciles records across the
//! hierarchy (provenance, mixin flattening, `appearsIn`, interface
//! placeholders, JSDoc type resolution) and hands read-only snapshots to the
//! transpiler workers.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::class_graph::{ClassGraph, MemberCategory, Provenance};
use crate::class_meta::{mtime_millis, write_if_changed, ClassMetaStore, ClassRecord, MemberMeta};
use crate::error::{MetaError, NotFoundError, ParseError};
use crate::marker::CompileMarker;
use crate::meta_parser::{parse_class_file, MetaParseOutput};

/// Type names that always mean the built-in, even when a project class of
/// the same short name exists in the current package.
const PRIMITIVE_TYPES: &[&str] = &[
    "var", "any", "void", "null", "undefined", "String", "Number", "Integer", "PositiveInteger",
    "PositiveNumber", "Float", "Double", "Boolean", "Array", "Object", "Map", "Function", "RegExp",
    "Date", "Error", "Promise", "Element", "Document", "Window", "Event", "Node", "Color", "Font",
    "Decorator", "Class", "Mixin", "Interface", "Theme", "arguments",
];

const INDEX_FILE: &str = "db.json";

// ═══════════════════════════════════════════════════════════════════════════════
// SYMBOL RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "symbolType", rename_all = "camelCase")]
pub enum SymbolType {
    Class {
        classname: String,
    },
    Package {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Member {
        classname: String,
        member_path: String,
    },
    #[serde(rename_all = "camelCase")]
    Environment {
        key: String,
        classname: String,
    },
}

/// Read access shared by the authoring database and worker snapshots.
pub trait SymbolResolver {
    fn class_record(&self, classname: &str) -> Option<&ClassRecord>;

    fn is_package(&self, name: &str) -> bool;

    fn environment_checks(&self) -> &BTreeMap<String, String>;

    /// Class, then package, then member of the nearest known class, then an
    /// exact environment check, then a wildcard environment check.
    fn symbol_type(&self, name: &str) -> Option<SymbolType> {
        if self.class_record(name).is_some() {
            return Some(SymbolType::Class {
                classname: name.to_string(),
            });
        }
        if self.is_package(name) {
            return Some(SymbolType::Package {
                name: name.to_string(),
            });
        }

        let mut end = name.len();
        while let Some(pos) = name[..end].rfind('.') {
            let prefix = &name[..pos];
            if self.class_record(prefix).is_some() {
                return Some(SymbolType::Member {
                    classname: prefix.to_string(),
                    member_path: name[pos + 1..].to_string(),
                });
            }
            end = pos;
        }

        let checks = self.environment_checks();
        if let Some(classname) = checks.get(name) {
            return Some(SymbolType::Environment {
                key: name.to_string(),
                classname: classname.clone(),
            });
        }
        checks
            .iter()
            .filter_map(|(pattern, classname)| {
                let prefix = pattern.strip_suffix('*')?;
                name.starts_with(prefix).then_some((prefix.len(), pattern, classname))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, pattern, classname)| SymbolType::Environment {
                key: pattern.clone(),
                classname: classname.clone(),
            })
    }
}

/// Immutable, serializable view of the database handed to workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSnapshot {
    pub classes: BTreeMap<String, ClassRecord>,
    pub packages: BTreeMap<String, bool>,
    pub environment_checks: BTreeMap<String, String>,
}

impl MetaSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl SymbolResolver for MetaSnapshot {
    fn class_record(&self, classname: &str) -> Option<&ClassRecord> {
        self.classes.get(classname)
    }

    fn is_package(&self, name: &str) -> bool {
        self.packages.get(name).copied().unwrap_or(false)
    }

    fn environment_checks(&self) -> &BTreeMap<String, String> {
        &self.environment_checks
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DATABASE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DbIndex {
    classnames: Vec<String>,
    #[serde(default)]
    environment_checks: BTreeMap<String, String>,
}

pub struct MetaDatabase {
    root_dir: PathBuf,
    stores: BTreeMap<String, ClassMetaStore>,
    files: HashMap<PathBuf, String>,
    packages: BTreeMap<String, bool>,
    environment_checks: BTreeMap<String, String>,
    dirty: BTreeSet<String>,
    warnings: Vec<CompileMarker>,
}

impl MetaDatabase {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            stores: BTreeMap::new(),
            files: HashMap::new(),
            packages: BTreeMap::new(),
            environment_checks: BTreeMap::new(),
            dirty: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Read `db.json` and every class record it lists. Records written by
    /// another metadata version are dropped and will be re-parsed.
    pub fn load(&mut self) -> Result<(), MetaError> {
        let index_path = self.root_dir.join(INDEX_FILE);
        let data = match fs::read_to_string(&index_path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(MetaError::Io {
                    path: index_path,
                    source,
                })
            }
        };
        let index: DbIndex = serde_json::from_str(&data).map_err(|source| MetaError::Json {
            path: index_path.clone(),
            source,
        })?;

        self.environment_checks.extend(index.environment_checks);
        for classname in index.classnames {
            let mut store = ClassMetaStore::new(&self.root_dir, &classname);
            match store.load() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(%classname, error = %e, "discarding unreadable metadata");
                    continue;
                }
            }
            if let Some(record) = store.record() {
                self.files
                    .insert(PathBuf::from(&record.source_filename), classname.clone());
            }
            self.stores.insert(classname.clone(), store);
            self.set_package_presence(&classname);
        }
        tracing::debug!(classes = self.stores.len(), "metadata database loaded");
        Ok(())
    }

    /// Write the index and every class record.
    pub fn save(&self) -> Result<(), MetaError> {
        for store in self.stores.values() {
            store.save()?;
        }
        let index = DbIndex {
            classnames: self.stores.keys().cloned().collect(),
            environment_checks: self.environment_checks.clone(),
        };
        let path = self.root_dir.join(INDEX_FILE);
        let data = serde_json::to_string_pretty(&index).map_err(|source| MetaError::Json {
            path: path.clone(),
            source,
        })?;
        write_if_changed(&path, &data)
    }

    pub fn classnames(&self) -> impl Iterator<Item = &String> {
        self.stores.keys()
    }

    pub fn get_meta_data(&self, classname: &str) -> Option<&ClassRecord> {
        self.stores.get(classname).and_then(|s| s.record())
    }

    pub fn classname_for_file(&self, path: &Path) -> Option<&str> {
        self.files.get(path).map(|s| s.as_str())
    }

    pub fn packages(&self) -> &BTreeMap<String, bool> {
        &self.packages
    }

    pub fn add_environment_checks(&mut self, checks: impl IntoIterator<Item = (String, String)>) {
        self.environment_checks.extend(checks);
    }

    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn mark_dirty(&mut self, classname: &str) {
        if self.stores.contains_key(classname) {
            self.dirty.insert(classname.to_string());
        }
    }

    /// Warnings produced by parses since the last call.
    pub fn take_warnings(&mut self) -> Vec<CompileMarker> {
        std::mem::take(&mut self.warnings)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Staging
    // ───────────────────────────────────────────────────────────────────────────

    /// Parse `path` if forced or if its record is missing or stale. Returns
    /// whether the record changed.
    pub fn add_file(&mut self, path: &Path, force: bool) -> Result<bool, MetaError> {
        let expected = self.files.get(path).cloned();
        self.add_class_file(expected.as_deref(), path, force)
    }

    /// Like `add_file` when the classname implied by the path is known.
    pub fn add_class_file(
        &mut self,
        classname: Option<&str>,
        path: &Path,
        force: bool,
    ) -> Result<bool, MetaError> {
        let mtime = mtime_millis(path).map_err(|source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !force && !self.is_stale(classname, path, mtime) {
            return Ok(false);
        }
        let output = parse_class_file(path, classname)?;
        self.stage(path, mtime, output);
        Ok(true)
    }

    /// Parse many files in parallel. Failures are logged and skipped, leaving
    /// any previous record in place. Returns the classnames whose record changed.
    pub fn add_files(&mut self, files: &[(Option<String>, PathBuf)], force: bool) -> Vec<String> {
        let pending: Vec<(Option<String>, PathBuf, u64)> = files
            .iter()
            .filter_map(|(classname, path)| match mtime_millis(path) {
                Ok(mtime) => {
                    let expected = classname.clone().or_else(|| self.files.get(path).cloned());
                    (force || self.is_stale(expected.as_deref(), path, mtime))
                        .then(|| (expected, path.clone(), mtime))
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot stat class file");
                    None
                }
            })
            .collect();

        let parsed: Vec<(PathBuf, u64, Result<MetaParseOutput, ParseError>)> = pending
            .into_par_iter()
            .map(|(classname, path, mtime)| {
                let result = parse_class_file(&path, classname.as_deref());
                (path, mtime, result)
            })
            .collect();

        let mut staged = Vec::new();
        for (path, mtime, result) in parsed {
            match result {
                Ok(output) => staged.push(self.stage(&path, mtime, output)),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "skipping class file"),
            }
        }
        staged
    }

    fn is_stale(&self, classname: Option<&str>, path: &Path, mtime: u64) -> bool {
        let classname = classname.or_else(|| self.files.get(path).map(|s| s.as_str()));
        match classname.and_then(|c| self.stores.get(c)) {
            Some(store) => store.is_stale(mtime),
            None => true,
        }
    }

    fn stage(&mut self, path: &Path, mtime: u64, output: MetaParseOutput) -> String {
        let MetaParseOutput { mut record, warnings } = output;
        record.last_modified = mtime;
        record.source_filename = path.to_string_lossy().to_string();
        let classname = record.classname.clone();

        if let Some(previous) = self.files.insert(path.to_path_buf(), classname.clone()) {
            if previous != classname {
                self.forget(&previous);
            }
        }
        self.stores
            .entry(classname.clone())
            .or_insert_with(|| ClassMetaStore::new(&self.root_dir, &classname))
            .set_record(record);
        self.set_package_presence(&classname);
        self.dirty.insert(classname.clone());
        self.warnings.extend(warnings);
        tracing::debug!(%classname, "staged class metadata");
        classname
    }

    /// Delete the record for `path`. Classes deriving from it are marked
    /// dirty so their reconciled view drops the removed ancestor.
    pub fn remove_file(&mut self, path: &Path) -> Result<Option<String>, MetaError> {
        let Some(classname) = self.files.remove(path) else {
            return Ok(None);
        };
        let derived: Vec<String> = ClassGraph::build(self.records())
            .direct_derived(&classname)
            .cloned()
            .collect();
        if let Some(store) = self.stores.get(&classname) {
            store.delete()?;
        }
        self.forget(&classname);
        self.dirty.extend(derived);
        Ok(Some(classname))
    }

    fn forget(&mut self, classname: &str) {
        self.stores.remove(classname);
        self.dirty.remove(classname);
        self.recompute_packages();
    }

    fn set_package_presence(&mut self, classname: &str) {
        let mut end = classname.len();
        while let Some(pos) = classname[..end].rfind('.') {
            self.packages.insert(classname[..pos].to_string(), true);
            end = pos;
        }
    }

    fn recompute_packages(&mut self) {
        for present in self.packages.values_mut() {
            *present = false;
        }
        let classnames: Vec<String> = self.stores.keys().cloned().collect();
        for classname in classnames {
            self.set_package_presence(&classname);
        }
    }

    fn records(&self) -> impl Iterator<Item = &ClassRecord> {
        self.stores.values().filter_map(|s| s.record())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ───────────────────────────────────────────────────────────────────────────

    /// Reconcile every dirty class and everything transitively derived from
    /// it, then persist the touched records. Returns the processed classes.
    pub fn reparse_all(&mut self) -> Result<Vec<String>, MetaError> {
        if self.dirty.is_empty() {
            return Ok(Vec::new());
        }
        let graph = ClassGraph::build(self.records());
        let closure = graph.derived_closure(self.dirty.iter());
        tracing::debug!(dirty = self.dirty.len(), closure = closure.len(), "reconciling metadata");

        let mut processed = Vec::new();
        for classname in &closure {
            let Some(mut record) = self.get_meta_data(classname).cloned() else {
                continue;
            };
            reset_derived(&mut record);
            self.resolve_types(&mut record);
            self.merge_mixins(&mut record);
            apply_provenance(&graph, &mut record);
            if record.is_abstract() {
                self.synthesize_interface_members(&graph, &mut record);
            }
            if let Some(store) = self.stores.get_mut(classname) {
                store.set_record(record);
                store.save()?;
            }
            processed.push(classname.clone());
        }
        self.dirty.clear();
        Ok(processed)
    }

    fn resolve_types(&self, record: &mut ClassRecord) {
        let package = record.package_name().to_string();
        let resolve = |type_name: &mut Option<String>| {
            if let Some(t) = type_name.as_mut() {
                *t = self.resolve_type(&package, t);
            }
        };
        let members = record
            .members
            .values_mut()
            .chain(record.statics.values_mut())
            .chain(record.construct.iter_mut())
            .chain(record.destruct.iter_mut());
        for member in members {
            for param in &mut member.params {
                resolve(&mut param.type_name);
            }
            if let Some(returns) = member.returns.as_mut() {
                resolve(&mut returns.type_name);
            }
        }
        for property in record.properties.values_mut() {
            resolve(&mut property.check);
        }
        for event in record.events.values_mut() {
            resolve(&mut event.type_name);
        }
    }

    /// Resolve a JSDoc type expression relative to `package`. Unions and
    /// array suffixes are resolved part by part.
    fn resolve_type(&self, package: &str, type_name: &str) -> String {
        if type_name.contains('|') {
            return type_name
                .split('|')
                .map(|part| self.resolve_type(package, part.trim()))
                .collect::<Vec<_>>()
                .join("|");
        }
        let (base, suffix) = match type_name.find("[]") {
            Some(pos) => type_name.split_at(pos),
            None => (type_name, ""),
        };
        if PRIMITIVE_TYPES.contains(&base) || self.stores.contains_key(base) || package.is_empty() {
            return type_name.to_string();
        }
        let qualified = format!("{}.{}", package, base);
        if self.stores.contains_key(&qualified) {
            format!("{}{}", qualified, suffix)
        } else {
            type_name.to_string()
        }
    }

    fn merge_mixins(&self, record: &mut ClassRecord) {
        for mixin in record.mixins.clone() {
            let Some(mixin_record) = self.get_meta_data(&mixin) else {
                tracing::debug!(classname = %record.classname, %mixin, "mixin has no metadata");
                continue;
            };
            for (name, member) in &mixin_record.members {
                if member.is_own() && !record.members.contains_key(name) {
                    let mut merged = member.clone();
                    merged.overridden_from = None;
                    merged.appears_in.clear();
                    merged.mixin = Some(mixin.clone());
                    record.members.insert(name.clone(), merged);
                }
            }
            for (name, property) in &mixin_record.properties {
                if property.is_own() && !record.properties.contains_key(name) {
                    let mut merged = property.clone();
                    merged.overridden_from = None;
                    merged.appears_in.clear();
                    merged.mixin = Some(mixin.clone());
                    record.properties.insert(name.clone(), merged);
                }
            }
        }
    }

    fn synthesize_interface_members(&self, graph: &ClassGraph, record: &mut ClassRecord) {
        for iface in graph.bound_interfaces(&record.classname) {
            let Some(iface_record) = self.get_meta_data(&iface) else {
                continue;
            };
            for (name, member) in &iface_record.members {
                if !member.is_own() || record.members.contains_key(name) {
                    continue;
                }
                if graph
                    .find_provenance(&record.classname, MemberCategory::Member, name)
                    .is_some()
                {
                    continue;
                }
                let placeholder = MemberMeta {
                    is_abstract: true,
                    from_interface: Some(iface.clone()),
                    appears_in: graph.appears_in(&record.classname, MemberCategory::Member, name),
                    overridden_from: None,
                    mixin: None,
                    ..member.clone()
                };
                record.members.insert(name.clone(), placeholder);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────────────────

    pub fn get_symbol_type(&self, name: &str) -> Option<SymbolType> {
        self.symbol_type(name)
    }

    /// The class's record plus every member and property inherited through
    /// its superclass chain, each with provenance and `appearsIn`.
    pub fn get_resolved_meta(&self, classname: &str) -> Result<ClassRecord, NotFoundError> {
        let mut resolved = self
            .get_meta_data(classname)
            .cloned()
            .ok_or_else(|| NotFoundError::new("class", classname))?;
        let graph = ClassGraph::build(self.records());

        let mut ancestor = resolved.super_class.clone();
        let mut depth = 0;
        while let Some(name) = ancestor {
            depth += 1;
            let Some(record) = self.get_meta_data(&name) else {
                break;
            };
            if depth > self.stores.len() {
                tracing::warn!(classname, "cyclic superclass chain");
                break;
            }
            for (member_name, member) in &record.members {
                if member.is_abstract || resolved.members.contains_key(member_name) {
                    continue;
                }
                let mut inherited = member.clone();
                inherited.appears_in =
                    graph.appears_in(classname, MemberCategory::Member, member_name);
                resolved.members.insert(member_name.clone(), inherited);
            }
            for (property_name, property) in &record.properties {
                if resolved.properties.contains_key(property_name) {
                    continue;
                }
                let mut inherited = property.clone();
                inherited.appears_in =
                    graph.appears_in(classname, MemberCategory::Property, property_name);
                resolved.properties.insert(property_name.clone(), inherited);
            }
            ancestor = record.super_class.clone();
        }
        Ok(resolved)
    }

    pub fn snapshot(&self) -> MetaSnapshot {
        MetaSnapshot {
            classes: self
                .stores
                .iter()
                .filter_map(|(name, store)| store.record().map(|r| (name.clone(), r.clone())))
                .collect(),
            packages: self.packages.clone(),
            environment_checks: self.environment_checks.clone(),
        }
    }
}

impl SymbolResolver for MetaDatabase {
    fn class_record(&self, classname: &str) -> Option<&ClassRecord> {
        self.get_meta_data(classname)
    }

    fn is_package(&self, name: &str) -> bool {
        self.packages.get(name).copied().unwrap_or(false)
    }

    fn environment_checks(&self) -> &BTreeMap<String, String> {
        &self.environment_checks
    }
}

/// Drop everything reconciliation adds so it can be recomputed from scratch.
fn reset_derived(record: &mut ClassRecord) {
    record.members.retain(|_, m| m.is_own());
    record.statics.retain(|_, m| m.is_own());
    record.properties.retain(|_, p| p.is_own());
    for member in record.members.values_mut().chain(record.statics.values_mut()) {
        member.overridden_from = None;
        member.appears_in.clear();
    }
    for property in record.properties.values_mut() {
        property.overridden_from = None;
        property.appears_in.clear();
    }
}

fn apply_provenance(graph: &ClassGraph, record: &mut ClassRecord) {
    let classname = record.classname.clone();
    let tables = [
        (MemberCategory::Member, &mut record.members),
        (MemberCategory::Static, &mut record.statics),
    ];
    for (category, table) in tables {
        for (name, member) in table.iter_mut() {
            match graph.find_provenance(&classname, category, name) {
                Some(Provenance::OverriddenFrom(from)) if member.is_own() => {
                    member.overridden_from = Some(from)
                }
                Some(Provenance::Mixin(mixin)) => member.mixin = Some(mixin),
                _ => {}
            }
            member.appears_in = graph.appears_in(&classname, category, name);
        }
    }
    for (name, property) in record.properties.iter_mut() {
        match graph.find_provenance(&classname, MemberCategory::Property, name) {
            Some(Provenance::OverriddenFrom(from)) if property.is_own() => {
                property.overridden_from = Some(from)
            }
            Some(Provenance::Mixin(mixin)) => property.mixin = Some(mixin),
            _ => {}
        }
        property.appears_in = graph.appears_in(&classname, MemberCategory::Property, name);
    }
}

//! Per-class compilation.
//!
//! Collects a class's dependencies (split into load, construct and runtime
//! edges), translation strings, asset directives and markers, runs the code
//! generation backend and writes the `.js`, `.js.map` and `.json` artifacts.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrowFunctionExpression, CallExpression, Expression, Function, IdentifierReference,
    ObjectExpression, ObjectPropertyKind, PropertyKey, StaticMemberExpression,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::{SourceType, Span};
use oxc_syntax::scope::ScopeFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::class_meta::mtime_millis;
use crate::error::CompileFailure;
use crate::marker::{
    CompileMarker, MARKER_DEPRECATED_CLASS, MARKER_TRANSFORM_FAILED, MARKER_UNRESOLVED_SYMBOL,
};
use crate::meta_db::{SymbolResolver, SymbolType};
use crate::meta_parser::{dotted_name, JsDocIndex, LineIndex};
use crate::transformer::{TransformOptions, Transformer};

pub const TRANSPILED_DIR: &str = "transpiled";

const TRANSLATION_METHODS: &[&str] = &["tr", "trn", "trc", "trnc", "marktr"];
const ENVIRONMENT_METHODS: &[&str] = &[
    "qx.core.Environment.get",
    "qx.core.Environment.select",
    "qx.core.Environment.getAsync",
    "qx.core.Environment.selectAsync",
    "qx.core.Environment.filter",
];
/// Host globals that are never reported as unresolved.
const GLOBALS: &[&str] = &[
    "window", "document", "navigator", "console", "Math", "JSON", "Object", "Array", "String",
    "Number", "Boolean", "Date", "RegExp", "Error", "Promise", "Symbol", "Map", "Set", "arguments",
    "undefined", "this",
];

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD INFO
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepFlags {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub load: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub construct: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub runtime: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepContext {
    Load,
    Construct,
    Runtime,
}

impl DepFlags {
    fn set(&mut self, context: DepContext) {
        match context {
            DepContext::Load => self.load = true,
            DepContext::Construct => self.construct = true,
            DepContext::Runtime => self.runtime = true,
        }
    }
}

/// Build-info record written next to each compiled class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledClassInfo {
    pub classname: String,
    pub hash: String,
    pub source_mtime: u64,
    #[serde(default)]
    pub depends_on: BTreeMap<String, DepFlags>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub translations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<CompileMarker>,
}

impl CompiledClassInfo {
    pub fn load_deps(&self) -> impl Iterator<Item = &String> {
        self.depends_on.iter().filter(|(_, f)| f.load).map(|(c, _)| c)
    }

    pub fn construct_deps(&self) -> impl Iterator<Item = &String> {
        self.depends_on
            .iter()
            .filter(|(_, f)| f.construct)
            .map(|(c, _)| c)
    }

    pub fn has_errors(&self) -> bool {
        self.markers.iter().any(|m| m.is_error())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub classname: String,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub minify: bool,
}

/// `<output>/transpiled/app/ui/Button.<ext>`
pub fn transpiled_path(output_dir: &Path, classname: &str, extension: &str) -> PathBuf {
    let mut path = output_dir.join(TRANSPILED_DIR);
    for segment in classname.split('.') {
        path.push(segment);
    }
    path.set_extension(extension);
    path
}

pub fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The previously written build info, when it is still valid: the recorded
/// source mtime matches and the compiled file is not older than the source.
pub fn load_if_up_to_date(output_dir: &Path, classname: &str, source_path: &Path) -> Option<CompiledClassInfo> {
    let info_path = transpiled_path(output_dir, classname, "json");
    let js_path = transpiled_path(output_dir, classname, "js");
    let source_mtime = mtime_millis(source_path).ok()?;
    let js_mtime = mtime_millis(&js_path).ok()?;
    let data = fs::read_to_string(&info_path).ok()?;
    let info: CompiledClassInfo = match serde_json::from_str(&data) {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!(classname, error = %e, "discarding unreadable build info");
            return None;
        }
    };
    (info.source_mtime == source_mtime && js_mtime >= source_mtime).then_some(info)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCY COLLECTION
// ═══════════════════════════════════════════════════════════════════════════════

struct DependencyCollector<'r, R: SymbolResolver + ?Sized> {
    classname: &'r str,
    resolver: &'r R,
    lines: &'r LineIndex,
    ignored: &'r [String],
    /// Top-level namespaces; unresolved names under them are reported.
    namespaces: BTreeSet<String>,
    context: DepContext,
    next_function_context: Option<DepContext>,
    depends_on: BTreeMap<String, DepFlags>,
    translations: BTreeSet<String>,
    environment: BTreeSet<String>,
    markers: Vec<CompileMarker>,
    reported: BTreeSet<String>,
}

impl<'r, R: SymbolResolver + ?Sized> DependencyCollector<'r, R> {
    fn add_dependency(&mut self, classname: &str, context: DepContext) {
        if classname == self.classname {
            return;
        }
        self.depends_on
            .entry(classname.to_string())
            .or_default()
            .set(context);
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern.as_str() || name.starts_with(&format!("{}.", pattern)),
        })
    }

    fn reference(&mut self, name: &str, span: Span) {
        let root = name.split('.').next().unwrap_or(name);
        if GLOBALS.contains(&root) || self.is_ignored(name) {
            return;
        }
        match self.resolver.symbol_type(name) {
            Some(SymbolType::Class { classname }) | Some(SymbolType::Member { classname, .. }) => {
                self.check_deprecated(&classname, span);
                self.add_dependency(&classname, self.context);
            }
            Some(SymbolType::Environment { classname, .. }) => {
                self.add_dependency(&classname, self.context)
            }
            Some(SymbolType::Package { .. }) => {}
            None => {
                if self.namespaces.contains(root) && self.reported.insert(name.to_string()) {
                    self.markers.push(
                        CompileMarker::warning(
                            MARKER_UNRESOLVED_SYMBOL,
                            self.classname,
                            format!("Unresolved symbol {}", name),
                        )
                        .at(self.lines.position(span.start)),
                    );
                }
            }
        }
    }

    fn check_deprecated(&mut self, classname: &str, span: Span) {
        if classname == self.classname {
            return;
        }
        let deprecated = self
            .resolver
            .class_record(classname)
            .and_then(|r| r.jsdoc.as_ref())
            .is_some_and(|d| d.is_deprecated());
        if deprecated && self.reported.insert(format!("deprecated:{}", classname)) {
            self.markers.push(
                CompileMarker::warning(
                    MARKER_DEPRECATED_CLASS,
                    self.classname,
                    format!("{} is deprecated", classname),
                )
                .at(self.lines.position(span.start)),
            );
        }
    }

    fn with_context(&mut self, context: DepContext, f: impl FnOnce(&mut Self)) {
        let saved = self.context;
        self.context = context;
        f(self);
        self.context = saved;
    }

    /// Walk a `qx.*.define` definition map, giving each section its context.
    fn visit_definition<'a>(&mut self, def: &ObjectExpression<'a>) {
        for prop in &def.properties {
            let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                continue;
            };
            let key = match &prop.key {
                PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                PropertyKey::StringLiteral(s) => s.value.to_string(),
                _ => continue,
            };
            match key.as_str() {
                "construct" => {
                    self.next_function_context = Some(DepContext::Construct);
                    self.with_context(DepContext::Construct, |c| c.visit_expression(&prop.value));
                    self.next_function_context = None;
                }
                "defer" => {
                    self.next_function_context = Some(DepContext::Load);
                    self.visit_expression(&prop.value);
                    self.next_function_context = None;
                }
                "members" | "statics" => match &prop.value {
                    // Function values run later; anything else is evaluated at load.
                    Expression::ObjectExpression(map) => {
                        for entry in &map.properties {
                            if let ObjectPropertyKind::ObjectProperty(entry) = entry {
                                self.visit_expression(&entry.value);
                            }
                        }
                    }
                    other => self.visit_expression(other),
                },
                _ => self.visit_expression(&prop.value),
            }
        }
    }

    fn visit_translation_call<'a>(&mut self, method: &str, call: &CallExpression<'a>) {
        let strings: Vec<String> = call
            .arguments
            .iter()
            .map_while(|arg| match arg {
                Argument::StringLiteral(s) => Some(s.value.to_string()),
                _ => None,
            })
            .collect();
        let msgids: &[String] = match method {
            "trn" => strings.get(..2).unwrap_or(&strings[..]),
            "trc" => strings.get(1..2).unwrap_or(&[]),
            "trnc" => strings.get(1..3).unwrap_or(&[]),
            _ => strings.get(..1).unwrap_or(&[]),
        };
        self.translations.extend(msgids.iter().cloned());
    }
}

impl<'a, 'r, R: SymbolResolver + ?Sized> Visit<'a> for DependencyCollector<'r, R> {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        let callee = dotted_name(&call.callee);
        if let Some(callee) = callee.as_deref() {
            if callee.starts_with("qx.")
                && callee.ends_with(".define")
                && matches!(call.arguments.first(), Some(Argument::StringLiteral(_)))
            {
                self.reference(callee, call.span);
                if let Some(Argument::ObjectExpression(def)) = call.arguments.get(1) {
                    self.visit_definition(def);
                }
                return;
            }

            let method = callee.rsplit('.').next().unwrap_or(callee);
            let is_translation = TRANSLATION_METHODS.contains(&method)
                && (callee.starts_with("this.") || callee.starts_with("qx.locale.Manager."));
            if is_translation {
                self.visit_translation_call(method, call);
            }

            if ENVIRONMENT_METHODS.contains(&callee) {
                if let Some(Argument::StringLiteral(key)) = call.arguments.first() {
                    self.environment.insert(key.value.to_string());
                    if let Some(SymbolType::Environment { classname, .. }) =
                        self.resolver.symbol_type(&key.value)
                    {
                        self.add_dependency(&classname, self.context);
                    }
                }
            }
        }
        oxc_ast_visit::walk::walk_call_expression(self, call);
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        let context = self.next_function_context.take().unwrap_or(DepContext::Runtime);
        self.with_context(context, |c| oxc_ast_visit::walk::walk_function(c, func, flags));
    }

    fn visit_arrow_function_expression(&mut self, func: &ArrowFunctionExpression<'a>) {
        let context = self.next_function_context.take().unwrap_or(DepContext::Runtime);
        self.with_context(context, |c| {
            oxc_ast_visit::walk::walk_arrow_function_expression(c, func)
        });
    }

    fn visit_static_member_expression(&mut self, member: &StaticMemberExpression<'a>) {
        let name = dotted_name(&member.object).map(|o| format!("{}.{}", o, member.property.name));
        match name {
            Some(name) if !name.starts_with("this.") => self.reference(&name, member.span),
            _ => oxc_ast_visit::walk::walk_static_member_expression(self, member),
        }
    }

    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        if self.resolver.class_record(&ident.name).is_some() {
            self.add_dependency(&ident.name, self.context);
        }
    }
}

/// Everything a compile learns about a class apart from the generated code.
#[derive(Debug, Clone, Default)]
pub struct ClassAnalysis {
    pub depends_on: BTreeMap<String, DepFlags>,
    pub translations: Vec<String>,
    pub assets: Vec<String>,
    pub environment: Vec<String>,
    pub markers: Vec<CompileMarker>,
}

/// Collect dependencies, directives, translations and markers of `source`.
pub fn analyse_class<R: SymbolResolver + ?Sized>(
    classname: &str,
    source: &str,
    filename: &str,
    resolver: &R,
) -> Result<ClassAnalysis, CompileFailure> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::default().with_module(false)).parse();
    if ret.panicked || !ret.errors.is_empty() {
        let message = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser aborted".to_string());
        return Err(CompileFailure::new(classname, format!("{}: {}", filename, message)));
    }

    let lines = LineIndex::new(source);
    let jsdocs = JsDocIndex::new(source, ret.program.comments.iter().map(|c| c.span));
    let mut require = Vec::new();
    let mut uses = Vec::new();
    let mut ignored = Vec::new();
    let mut assets = BTreeSet::new();
    for doc in jsdocs.all() {
        require.extend(doc.directives("require"));
        uses.extend(doc.directives("use"));
        ignored.extend(doc.directives("ignore"));
        assets.extend(doc.directives("asset"));
    }

    let mut namespaces: BTreeSet<String> = BTreeSet::new();
    if let Some(root) = classname.split('.').next() {
        namespaces.insert(root.to_string());
    }

    let mut collector = DependencyCollector {
        classname,
        resolver,
        lines: &lines,
        ignored: &ignored,
        namespaces,
        context: DepContext::Load,
        next_function_context: None,
        depends_on: BTreeMap::new(),
        translations: BTreeSet::new(),
        environment: BTreeSet::new(),
        markers: Vec::new(),
        reported: BTreeSet::new(),
    };
    collector.visit_program(&ret.program);

    for name in &require {
        collector.add_dependency(name, DepContext::Load);
    }
    for name in &uses {
        collector.add_dependency(name, DepContext::Runtime);
    }

    Ok(ClassAnalysis {
        depends_on: collector.depends_on,
        translations: collector.translations.into_iter().collect(),
        assets: assets.into_iter().collect(),
        environment: collector.environment.into_iter().collect(),
        markers: collector.markers,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE
// ═══════════════════════════════════════════════════════════════════════════════

/// Compile one class and write its artifacts. A backend failure is still
/// written as build info carrying an error marker, then reported.
pub fn compile_class<R: SymbolResolver + ?Sized>(
    request: &CompileRequest,
    resolver: &R,
    transformer: &dyn Transformer,
) -> Result<CompiledClassInfo, CompileFailure> {
    let classname = request.classname.as_str();
    let fail = |message: String| CompileFailure::new(classname, message);

    // Stat before reading: a later edit must leave an older recorded mtime.
    let source_mtime = mtime_millis(&request.source_path)
        .map_err(|e| fail(format!("cannot stat {}: {}", request.source_path.display(), e)))?;
    let source = fs::read_to_string(&request.source_path)
        .map_err(|e| fail(format!("cannot read {}: {}", request.source_path.display(), e)))?;
    let filename = request.source_path.to_string_lossy();

    let analysis = analyse_class(classname, &source, &filename, resolver)?;
    let mut info = CompiledClassInfo {
        classname: classname.to_string(),
        hash: hash_source(&source),
        source_mtime,
        depends_on: analysis.depends_on,
        translations: analysis.translations,
        assets: analysis.assets,
        environment: analysis.environment,
        markers: analysis.markers,
    };

    let options = TransformOptions {
        minify: request.minify,
        source_map: true,
    };
    let js_path = transpiled_path(&request.output_dir, classname, "js");
    let map_path = transpiled_path(&request.output_dir, classname, "js.map");
    let info_path = transpiled_path(&request.output_dir, classname, "json");
    let write = |path: &Path, data: &str| -> Result<(), CompileFailure> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        fs::write(path, data).map_err(|e| fail(format!("cannot write {}: {}", path.display(), e)))
    };

    match transformer.transform(&source, &filename, &options) {
        Ok(output) => {
            let map_name = map_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let code = format!("{}\n\n//# sourceMappingURL={}\n", output.code.trim_end(), map_name);
            write(&js_path, &code)?;
            if let Some(map) = output.map {
                write(&map_path, &map)?;
            }
        }
        Err(message) => {
            tracing::error!(classname, %message, "transform failed");
            info.markers.push(CompileMarker::error(
                MARKER_TRANSFORM_FAILED,
                classname,
                message.clone(),
            ));
            let data = serde_json::to_string_pretty(&info).map_err(|e| fail(e.to_string()))?;
            write(&info_path, &data)?;
            return Err(fail(message));
        }
    }

    let data = serde_json::to_string_pretty(&info).map_err(|e| fail(e.to_string()))?;
    write(&info_path, &data)?;
    tracing::debug!(classname, deps = info.depends_on.len(), "compiled class");
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_meta::{ClassRecord, ClassType};
    use crate::jsdoc::JsDoc;
    use crate::meta_db::MetaSnapshot;
    use crate::transformer::PassthroughTransformer;

    fn snapshot(classes: &[&str]) -> MetaSnapshot {
        let mut snapshot = MetaSnapshot::default();
        for classname in classes {
            snapshot
                .classes
                .insert(classname.to_string(), ClassRecord::new(classname, ClassType::Class));
            let mut end = classname.len();
            while let Some(pos) = classname[..end].rfind('.') {
                snapshot.packages.insert(classname[..pos].to_string(), true);
                end = pos;
            }
        }
        snapshot
    }

    const MAIN: &str = r#"
/**
 * @require(app.Boot)
 * @use(app.Lazy)
 * @ignore(app.Ghost)
 * @asset(app/icons/*)
 */
qx.Class.define("app.Main", {
  extend: qx.core.Object,
  include: [app.MHelper],

  construct() {
    this.base(arguments);
    this.__model = new app.Model();
  },

  statics: {
    DEFAULT: new app.Config(),
    create() { return new app.Runtime(); }
  },

  members: {
    run() {
      var label = this.tr("Hello %1", "x");
      var many = this.trn("one file", "%1 files", 2);
      if (qx.core.Environment.get("qx.debug")) {
        app.Missing.doIt();
        app.Ghost.boo();
      }
      return app.Old.create();
    }
  },

  defer(statics) {
    app.Registry.register(statics);
  }
});
"#;

    fn flags(info: &BTreeMap<String, DepFlags>, name: &str) -> DepFlags {
        info.get(name).copied().unwrap_or_default()
    }

    #[test]
    fn test_dependency_contexts() {
        let mut snap = snapshot(&[
            "qx.core.Object",
            "qx.core.Environment",
            "app.MHelper",
            "app.Model",
            "app.Config",
            "app.Runtime",
            "app.Registry",
            "app.Boot",
            "app.Lazy",
            "app.Old",
        ]);
        snap.environment_checks
            .insert("qx.debug".into(), "qx.core.Environment".into());
        let analysis = analyse_class("app.Main", MAIN, "app/Main.js", &snap).unwrap();
        let deps = &analysis.depends_on;

        assert!(flags(deps, "qx.core.Object").load);
        assert!(flags(deps, "app.MHelper").load);
        assert!(flags(deps, "app.Config").load);
        assert!(flags(deps, "app.Registry").load);
        assert!(flags(deps, "app.Boot").load);
        assert!(flags(deps, "app.Model").construct);
        assert!(!flags(deps, "app.Model").load);
        assert!(flags(deps, "app.Runtime").runtime);
        assert!(flags(deps, "app.Lazy").runtime);
        assert!(flags(deps, "app.Old").runtime);
        assert!(flags(deps, "qx.core.Environment").runtime);
        assert!(!deps.contains_key("app.Main"));

        assert_eq!(analysis.translations, vec!["%1 files", "Hello %1", "one file"]);
        assert_eq!(analysis.assets, vec!["app/icons/*"]);
        assert_eq!(analysis.environment, vec!["qx.debug"]);
    }

    #[test]
    fn test_markers_for_unresolved_and_deprecated() {
        let mut snap = snapshot(&["qx.core.Object", "app.Old"]);
        let old = snap.classes.get_mut("app.Old").unwrap();
        old.jsdoc = Some(JsDoc::parse("/** @deprecated use app.New */"));

        let analysis = analyse_class("app.Main", MAIN, "app/Main.js", &snap).unwrap();
        let codes: Vec<(&str, &str)> = analysis
            .markers
            .iter()
            .map(|m| (m.code.as_str(), m.message.as_str()))
            .collect();
        assert!(codes.contains(&(MARKER_UNRESOLVED_SYMBOL, "Unresolved symbol app.Missing.doIt")));
        assert!(codes.contains(&(MARKER_DEPRECATED_CLASS, "app.Old is deprecated")));
        assert!(!codes.iter().any(|(_, m)| m.contains("app.Ghost")));
    }

    #[test]
    fn test_compile_writes_artifacts_and_detects_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("Main.js");
        fs::write(&source_path, MAIN).unwrap();
        let output_dir = dir.path().join("out");
        let request = CompileRequest {
            classname: "app.Main".into(),
            source_path: source_path.clone(),
            output_dir: output_dir.clone(),
            minify: false,
        };

        let info = compile_class(&request, &snapshot(&["qx.core.Object"]), &PassthroughTransformer)
            .unwrap();
        let js = fs::read_to_string(transpiled_path(&output_dir, "app.Main", "js")).unwrap();
        assert!(js.ends_with("//# sourceMappingURL=Main.js.map\n"));
        assert!(transpiled_path(&output_dir, "app.Main", "js.map").is_file());

        let cached = load_if_up_to_date(&output_dir, "app.Main", &source_path).unwrap();
        assert_eq!(cached, info);

        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&source_path)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(load_if_up_to_date(&output_dir, "app.Main", &source_path).is_none());
    }

    /// Edits the source file while it is being transformed.
    struct EditingTransformer {
        source_path: std::path::PathBuf,
    }

    impl Transformer for EditingTransformer {
        fn name(&self) -> &str {
            "editing"
        }

        fn transform(&self, source: &str, _: &str, _: &TransformOptions) -> Result<crate::transformer::TransformOutput, String> {
            let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
            fs::write(&self.source_path, format!("{}\n// edited\n", source)).unwrap();
            fs::File::options()
                .write(true)
                .open(&self.source_path)
                .unwrap()
                .set_modified(later)
                .unwrap();
            Ok(crate::transformer::TransformOutput {
                code: source.to_string(),
                map: None,
            })
        }
    }

    #[test]
    fn test_edit_during_compile_is_not_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("Main.js");
        fs::write(&source_path, MAIN).unwrap();
        let before = mtime_millis(&source_path).unwrap();
        let request = CompileRequest {
            classname: "app.Main".into(),
            source_path: source_path.clone(),
            output_dir: dir.path().join("out"),
            minify: false,
        };
        let editing = EditingTransformer {
            source_path: source_path.clone(),
        };
        let info = compile_class(&request, &snapshot(&["qx.core.Object"]), &editing).unwrap();
        assert_eq!(info.source_mtime, before);
        assert_eq!(info.hash, hash_source(MAIN));
        assert!(load_if_up_to_date(&request.output_dir, "app.Main", &source_path).is_none());
    }

    struct Failing;

    impl Transformer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn transform(&self, _: &str, _: &str, _: &TransformOptions) -> Result<crate::transformer::TransformOutput, String> {
            Err("backend exploded".into())
        }
    }

    #[test]
    fn test_transform_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("Main.js");
        fs::write(&source_path, MAIN).unwrap();
        let request = CompileRequest {
            classname: "app.Main".into(),
            source_path,
            output_dir: dir.path().join("out"),
            minify: false,
        };
        let err = compile_class(&request, &MetaSnapshot::default(), &Failing).unwrap_err();
        assert_eq!(err.message, "backend exploded");
        let info_path = transpiled_path(&request.output_dir, "app.Main", "json");
        let info: CompiledClassInfo =
            serde_json::from_str(&fs::read_to_string(info_path).unwrap()).unwrap();
        assert!(info.has_errors());
    }
}

//! Structural metadata extraction.
//!
//! Parses one class file with oxc and turns its `qx.*.define(...)` call into a
//! `ClassRecord`. There is no cross-file knowledge here and no shared state,
//! so many files can be parsed in parallel.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, BindingPattern, CallExpression, Expression, FormalParameters,
    ObjectExpression, ObjectPropertyKind, PropertyKey, Statement,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use oxc_syntax::operator::UnaryOperator;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::class_meta::{
    Access, ClassRecord, ClassType, EventMeta, Location, MemberKind, MemberMeta, ParamMeta,
    PropertyMeta, ReturnMeta, SourceLocation,
};
use crate::error::ParseError;
use crate::jsdoc::JsDoc;
use crate::marker::{CompileMarker, MARKER_CLASSNAME_MISMATCH, MARKER_DUPLICATE_DEFINITION};

#[derive(Debug, Clone)]
pub struct MetaParseOutput {
    pub record: ClassRecord,
    pub warnings: Vec<CompileMarker>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE POSITIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Byte offset → 1-based line/column lookup.
pub(crate) struct LineIndex {
    line_starts: Vec<u32>,
}

impl LineIndex {
    pub(crate) fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self { line_starts }
    }

    pub(crate) fn position(&self, offset: u32) -> SourceLocation {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line - 1];
        SourceLocation {
            line: line as u32,
            column: offset - line_start + 1,
        }
    }

    pub(crate) fn location(&self, span: Span) -> Location {
        Location {
            start: self.position(span.start),
            end: self.position(span.end),
        }
    }
}

/// The `/** ... */` comments of a file, ordered by position.
pub(crate) struct JsDocIndex<'s> {
    source: &'s str,
    spans: Vec<Span>,
}

impl<'s> JsDocIndex<'s> {
    pub(crate) fn new(source: &'s str, comments: impl Iterator<Item = Span>) -> Self {
        let mut spans: Vec<Span> = comments
            .filter(|span| source[span.start as usize..span.end as usize].starts_with("/**"))
            .collect();
        spans.sort_by_key(|s| s.start);
        Self { source, spans }
    }

    /// The doc comment that directly precedes `pos`, separated only by whitespace.
    pub(crate) fn before(&self, pos: u32) -> Option<JsDoc> {
        let idx = self.spans.partition_point(|s| s.end <= pos);
        if idx == 0 {
            return None;
        }
        let span = self.spans[idx - 1];
        let between = &self.source[span.end as usize..pos as usize];
        if !between.trim().is_empty() {
            return None;
        }
        Some(JsDoc::parse(
            &self.source[span.start as usize..span.end as usize],
        ))
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = JsDoc> + '_ {
        self.spans
            .iter()
            .map(|span| JsDoc::parse(&self.source[span.start as usize..span.end as usize]))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AST HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn define_type(callee: &str) -> Option<ClassType> {
    match callee {
        "qx.Class.define" | "qx.Bootstrap.define" => Some(ClassType::Class),
        "qx.Mixin.define" => Some(ClassType::Mixin),
        "qx.Interface.define" => Some(ClassType::Interface),
        "qx.Theme.define" => Some(ClassType::Theme),
        _ => None,
    }
}

/// `a.b.c` for a chain of plain identifiers, `None` for anything else.
pub(crate) fn dotted_name(expr: &Expression) -> Option<String> {
    match expr {
        Expression::Identifier(ident) => Some(ident.name.to_string()),
        Expression::ThisExpression(_) => Some("this".to_string()),
        Expression::StaticMemberExpression(member) => {
            let object = dotted_name(&member.object)?;
            Some(format!("{}.{}", object, member.property.name))
        }
        Expression::ParenthesizedExpression(paren) => dotted_name(&paren.expression),
        _ => None,
    }
}

fn property_key_name(key: &PropertyKey) -> Option<String> {
    match key {
        PropertyKey::StaticIdentifier(id) => Some(id.name.to_string()),
        PropertyKey::StringLiteral(s) => Some(s.value.to_string()),
        _ => None,
    }
}

fn string_value(expr: &Expression) -> Option<String> {
    match expr {
        Expression::StringLiteral(s) => Some(s.value.to_string()),
        _ => None,
    }
}

fn bool_value(expr: &Expression) -> Option<bool> {
    match expr {
        Expression::BooleanLiteral(b) => Some(b.value),
        _ => None,
    }
}

/// A single dotted name or an array of them.
fn names_list(expr: &Expression) -> Vec<String> {
    match expr {
        Expression::ArrayExpression(array) => array
            .elements
            .iter()
            .filter_map(|el| el.as_expression())
            .filter_map(dotted_name)
            .collect(),
        other => dotted_name(other).into_iter().collect(),
    }
}

fn function_params<'b, 'a>(expr: &'b Expression<'a>) -> Option<&'b FormalParameters<'a>> {
    match expr {
        Expression::FunctionExpression(func) => Some(&*func.params),
        Expression::ArrowFunctionExpression(arrow) => Some(&*arrow.params),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFINITION EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

struct DefineFinder<'s> {
    source: &'s str,
    file: &'s str,
    expected_classname: Option<&'s str>,
    lines: LineIndex,
    jsdocs: JsDocIndex<'s>,
    record: Option<ClassRecord>,
    error: Option<ParseError>,
    warnings: Vec<CompileMarker>,
}

impl<'a, 's> Visit<'a> for DefineFinder<'s> {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        let class_type = dotted_name(&call.callee).as_deref().and_then(define_type);
        let Some(class_type) = class_type else {
            oxc_ast_visit::walk::walk_call_expression(self, call);
            return;
        };

        if let Some(first) = &self.record {
            let second = match call.arguments.first() {
                Some(Argument::StringLiteral(s)) => s.value.to_string(),
                _ => "<anonymous>".to_string(),
            };
            tracing::warn!(file = self.file, first = %first.classname, second = %second, "ignoring second definition");
            self.warnings.push(
                CompileMarker::warning(
                    MARKER_DUPLICATE_DEFINITION,
                    &first.classname,
                    format!("Second definition of {} in {} is ignored", second, self.file),
                )
                .at(self.lines.position(call.span.start)),
            );
            return;
        }
        if self.error.is_some() {
            return;
        }

        match self.extract(call, class_type) {
            Ok(record) => self.record = Some(record),
            Err(e) => self.error = Some(e),
        }
    }
}

impl<'s> DefineFinder<'s> {
    fn text(&self, span: Span) -> String {
        self.source[span.start as usize..span.end as usize].to_string()
    }

    fn invalid(&self, message: impl Into<String>) -> ParseError {
        ParseError::InvalidDefinition {
            file: self.file.to_string(),
            message: message.into(),
        }
    }

    fn extract<'a>(
        &mut self,
        call: &CallExpression<'a>,
        class_type: ClassType,
    ) -> Result<ClassRecord, ParseError> {
        let classname = match call.arguments.first() {
            Some(Argument::StringLiteral(s)) => s.value.to_string(),
            _ => return Err(self.invalid("the first argument of define must be a string literal")),
        };

        if let Some(expected) = self.expected_classname {
            if expected != classname {
                tracing::warn!(file = self.file, declared = %classname, expected, "classname does not match file path");
                self.warnings.push(
                    CompileMarker::warning(
                        MARKER_CLASSNAME_MISMATCH,
                        &classname,
                        format!("{} declares {} but its path implies {}", self.file, classname, expected),
                    )
                    .at(self.lines.position(call.span.start)),
                );
            }
        }

        let mut record = ClassRecord::new(&classname, class_type);
        record.source_filename = self.file.to_string();
        record.location = Some(self.lines.location(call.span));
        record.jsdoc = self.jsdocs.before(call.span.start);

        match call.arguments.get(1) {
            Some(Argument::ObjectExpression(def)) => self.read_definition(def, &mut record)?,
            Some(Argument::NullLiteral(_)) | None => {}
            Some(_) => return Err(self.invalid("the second argument of define must be an object literal")),
        }

        Ok(record)
    }

    fn read_definition<'a>(
        &mut self,
        def: &ObjectExpression<'a>,
        record: &mut ClassRecord,
    ) -> Result<(), ParseError> {
        let mut construct_annotations = Vec::new();
        let mut destruct_annotations = Vec::new();

        for prop in &def.properties {
            let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                continue;
            };
            let Some(key) = property_key_name(&prop.key) else {
                continue;
            };
            let value = &prop.value;

            match key.as_str() {
                "type" => record.kind = string_value(value),
                "extend" => match record.class_type {
                    ClassType::Interface => record.interfaces.extend(names_list(value)),
                    _ => record.super_class = dotted_name(value),
                },
                "include" => record.mixins.extend(names_list(value)),
                "implement" => record.interfaces.extend(names_list(value)),
                "construct" => {
                    let jsdoc = self.jsdocs.before(prop.span.start);
                    record.construct = Some(self.member_meta("construct", value, jsdoc, prop.span));
                }
                "destruct" => {
                    let jsdoc = self.jsdocs.before(prop.span.start);
                    record.destruct = Some(self.member_meta("destruct", value, jsdoc, prop.span));
                }
                "members" => record.members = self.read_members(value)?,
                "statics" => record.statics = self.read_members(value)?,
                "properties" => record.properties = self.read_properties(value)?,
                "events" => record.events = self.read_events(value),
                "environment" => {
                    if let Expression::ObjectExpression(env) = value {
                        for entry in &env.properties {
                            if let ObjectPropertyKind::ObjectProperty(entry) = entry {
                                if let Some(name) = property_key_name(&entry.key) {
                                    record.environment.insert(name, self.text(entry.value.span()));
                                }
                            }
                        }
                    }
                }
                "defer" => record.has_defer = true,
                "@" => record.annotations = self.annotation_texts(value),
                "@construct" => construct_annotations = self.annotation_texts(value),
                "@destruct" => destruct_annotations = self.annotation_texts(value),
                _ => {}
            }
        }

        if let Some(construct) = record.construct.as_mut() {
            construct.annotations = construct_annotations;
        }
        if let Some(destruct) = record.destruct.as_mut() {
            destruct.annotations = destruct_annotations;
        }
        Ok(())
    }

    fn annotation_texts<'a>(&self, value: &Expression<'a>) -> Vec<String> {
        match value {
            Expression::ArrayExpression(array) => array
                .elements
                .iter()
                .filter_map(|el| el.as_expression())
                .map(|expr| self.text(expr.span()))
                .collect(),
            other => vec![self.text(other.span())],
        }
    }

    /// Annotations keyed `@name` inside a members/statics/properties map.
    fn collect_annotations<'a>(&self, map: &ObjectExpression<'a>) -> HashMap<String, Vec<String>> {
        let mut annotations = HashMap::new();
        for prop in &map.properties {
            if let ObjectPropertyKind::ObjectProperty(prop) = prop {
                if let Some(key) = property_key_name(&prop.key) {
                    if let Some(target) = key.strip_prefix('@') {
                        if !target.is_empty() {
                            annotations.insert(target.to_string(), self.annotation_texts(&prop.value));
                        }
                    }
                }
            }
        }
        annotations
    }

    fn read_members<'a>(
        &mut self,
        value: &Expression<'a>,
    ) -> Result<BTreeMap<String, MemberMeta>, ParseError> {
        let Expression::ObjectExpression(map) = value else {
            return Err(self.invalid("members and statics must be object literals"));
        };
        let mut annotations = self.collect_annotations(map);
        let mut members = BTreeMap::new();

        for prop in &map.properties {
            let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                continue;
            };
            let Some(name) = property_key_name(&prop.key) else {
                continue;
            };
            if name.starts_with('@') {
                continue;
            }
            let jsdoc = self.jsdocs.before(prop.span.start);
            let mut meta = self.member_meta(&name, &prop.value, jsdoc, prop.span);
            meta.annotations = annotations.remove(&name).unwrap_or_default();
            members.insert(name, meta);
        }
        Ok(members)
    }

    fn member_meta<'a>(
        &self,
        name: &str,
        value: &Expression<'a>,
        jsdoc: Option<JsDoc>,
        span: Span,
    ) -> MemberMeta {
        let params = function_params(value);
        let kind = if params.is_some() {
            MemberKind::Function
        } else {
            MemberKind::Variable
        };
        let actual = params
            .map(|p| self.actual_params(p))
            .unwrap_or_default();

        MemberMeta {
            kind,
            access: Access::from_name(name),
            location: Some(self.lines.location(span)),
            params: reconcile_params(&actual, jsdoc.as_ref()),
            returns: jsdoc.as_ref().and_then(|d| d.returns.as_ref()).map(|r| ReturnMeta {
                type_name: r.type_name.clone(),
                description: r.description.clone(),
            }),
            jsdoc,
            ..MemberMeta::default()
        }
    }

    /// Parameter names and default-value text, in signature order.
    fn actual_params<'a>(&self, params: &FormalParameters<'a>) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        for param in &params.items {
            let text = self.text(param.span);
            let default = text.find('=').map(|i| text[i + 1..].trim().to_string());
            let name = match &param.pattern {
                BindingPattern::BindingIdentifier(id) => id.name.to_string(),
                _ => text.split('=').next().unwrap_or("").trim().to_string(),
            };
            out.push((name, default));
        }
        if let Some(rest) = &params.rest {
            out.push((self.text(rest.span()).trim().to_string(), None));
        }
        out
    }

    fn read_properties<'a>(
        &mut self,
        value: &Expression<'a>,
    ) -> Result<BTreeMap<String, PropertyMeta>, ParseError> {
        let Expression::ObjectExpression(map) = value else {
            return Err(self.invalid("properties must be an object literal"));
        };
        let mut annotations = self.collect_annotations(map);
        let mut properties = BTreeMap::new();

        for prop in &map.properties {
            let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                continue;
            };
            let Some(name) = property_key_name(&prop.key) else {
                continue;
            };
            if name.starts_with('@') {
                continue;
            }

            let mut meta = match &prop.value {
                Expression::StringLiteral(s) => PropertyMeta {
                    check: Some(s.value.to_string()),
                    ..PropertyMeta::default()
                },
                Expression::ObjectExpression(def) => self.property_definition(def),
                other => {
                    tracing::warn!(file = self.file, property = %name, "unrecognised property definition");
                    PropertyMeta {
                        init: Some(self.text(other.span())),
                        ..PropertyMeta::default()
                    }
                }
            };
            meta.location = Some(self.lines.location(prop.span));
            meta.jsdoc = self.jsdocs.before(prop.span.start);
            if let Some(extra) = annotations.remove(&name) {
                meta.annotations.extend(extra);
            }
            properties.insert(name, meta);
        }
        Ok(properties)
    }

    fn property_definition<'a>(&self, def: &ObjectExpression<'a>) -> PropertyMeta {
        let mut meta = PropertyMeta::default();
        for entry in &def.properties {
            let ObjectPropertyKind::ObjectProperty(entry) = entry else {
                continue;
            };
            let Some(key) = property_key_name(&entry.key) else {
                continue;
            };
            let value = &entry.value;
            match key.as_str() {
                "check" => {
                    meta.check = Some(string_value(value).unwrap_or_else(|| self.text(value.span())))
                }
                "init" => meta.init = Some(self.text(value.span())),
                "nullable" => meta.nullable = bool_value(value).unwrap_or(false),
                "event" => meta.event = string_value(value),
                "apply" => meta.apply = string_value(value),
                "refine" => meta.refine = bool_value(value).unwrap_or(false),
                "themeable" => meta.themeable = bool_value(value).unwrap_or(false),
                "inheritable" => meta.inheritable = bool_value(value).unwrap_or(false),
                "group" => {
                    if let Expression::ArrayExpression(array) = value {
                        meta.group = array
                            .elements
                            .iter()
                            .filter_map(|el| el.as_expression())
                            .filter_map(string_value)
                            .collect();
                    }
                }
                "@" => meta.annotations = self.annotation_texts(value),
                _ => {}
            }
        }
        meta
    }

    fn read_events<'a>(&self, value: &Expression<'a>) -> BTreeMap<String, EventMeta> {
        let mut events = BTreeMap::new();
        let Expression::ObjectExpression(map) = value else {
            return events;
        };
        for prop in &map.properties {
            if let ObjectPropertyKind::ObjectProperty(prop) = prop {
                if let Some(name) = property_key_name(&prop.key) {
                    events.insert(
                        name,
                        EventMeta {
                            type_name: string_value(&prop.value),
                            jsdoc: self.jsdocs.before(prop.span.start),
                        },
                    );
                }
            }
        }
        events
    }
}

/// Signature decides which parameters exist and their order; JSDoc decides
/// their type and optionality.
fn reconcile_params(actual: &[(String, Option<String>)], jsdoc: Option<&JsDoc>) -> Vec<ParamMeta> {
    actual
        .iter()
        .map(|(name, default)| {
            let doc = jsdoc.and_then(|d| d.param(name));
            ParamMeta {
                name: name.clone(),
                type_name: doc.and_then(|d| d.type_name.clone()),
                optional: doc.map(|d| d.optional).unwrap_or(default.is_some()),
                default_value: default
                    .clone()
                    .or_else(|| doc.and_then(|d| d.default_value.clone())),
                description: doc.map(|d| d.description.clone()).unwrap_or_default(),
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Extract the single class definition contained in `source`.
pub fn parse_class_source(
    source: &str,
    filename: &str,
    expected_classname: Option<&str>,
) -> Result<MetaParseOutput, ParseError> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(false);
    let ret = Parser::new(&allocator, source, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        let message = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser aborted".to_string());
        return Err(ParseError::Syntax {
            file: filename.to_string(),
            message,
        });
    }

    let mut finder = DefineFinder {
        source,
        file: filename,
        expected_classname,
        lines: LineIndex::new(source),
        jsdocs: JsDocIndex::new(source, ret.program.comments.iter().map(|c| c.span)),
        record: None,
        error: None,
        warnings: Vec::new(),
    };
    finder.visit_program(&ret.program);

    if let Some(error) = finder.error {
        return Err(error);
    }
    match finder.record {
        Some(record) => Ok(MetaParseOutput {
            record,
            warnings: finder.warnings,
        }),
        None => Err(ParseError::NoDefinition {
            file: filename.to_string(),
        }),
    }
}

pub fn parse_class_file(
    path: &Path,
    expected_classname: Option<&str>,
) -> Result<MetaParseOutput, ParseError> {
    let source = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_class_source(&source, &path.to_string_lossy(), expected_classname)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANNOTATION EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluate stored annotation source text into a JSON value. Anything that is
/// not a literal (or a `new Some.Class(...)` of literals) yields `None`.
pub fn evaluate_annotation(text: &str) -> Option<serde_json::Value> {
    let wrapped = format!("({});", text);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &wrapped, SourceType::default()).parse();
    if !ret.errors.is_empty() {
        tracing::warn!(annotation = text, "cannot parse annotation");
        return None;
    }
    let value = match ret.program.body.first() {
        Some(Statement::ExpressionStatement(stmt)) => literal_to_json(&stmt.expression),
        _ => None,
    };
    if value.is_none() {
        tracing::warn!(annotation = text, "annotation is not a static value");
    }
    value
}

fn literal_to_json(expr: &Expression) -> Option<serde_json::Value> {
    use serde_json::Value;
    match expr {
        Expression::ParenthesizedExpression(p) => literal_to_json(&p.expression),
        Expression::StringLiteral(s) => Some(Value::String(s.value.to_string())),
        Expression::NumericLiteral(n) => number_to_json(n.value),
        Expression::BooleanLiteral(b) => Some(Value::Bool(b.value)),
        Expression::NullLiteral(_) => Some(Value::Null),
        Expression::UnaryExpression(u) if u.operator == UnaryOperator::UnaryNegation => {
            match &u.argument {
                Expression::NumericLiteral(n) => number_to_json(-n.value),
                _ => None,
            }
        }
        Expression::ArrayExpression(array) => {
            let mut items = Vec::new();
            for el in &array.elements {
                items.push(literal_to_json(el.as_expression()?)?);
            }
            Some(Value::Array(items))
        }
        Expression::ObjectExpression(obj) => {
            let mut map = serde_json::Map::new();
            for prop in &obj.properties {
                let ObjectPropertyKind::ObjectProperty(prop) = prop else {
                    return None;
                };
                let key = property_key_name(&prop.key)?;
                map.insert(key, literal_to_json(&prop.value)?);
            }
            Some(Value::Object(map))
        }
        Expression::NewExpression(new_expr) => {
            let class = dotted_name(&new_expr.callee)?;
            let mut args = Vec::new();
            for arg in &new_expr.arguments {
                args.push(literal_to_json(arg.as_expression()?)?);
            }
            Some(serde_json::json!({ "$new": class, "args": args }))
        }
        _ => None,
    }
}

fn number_to_json(n: f64) -> Option<serde_json::Value> {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Some(serde_json::Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(serde_json::Value::Number)
    }
}

//! Code generation backends.
//!
//! The compiler only needs `transform(source) -> { code, map }`; backends are
//! looked up by name in an explicit registry.

use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::NotFoundError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    pub minify: bool,
    pub source_map: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOutput {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    fn transform(
        &self,
        source: &str,
        filename: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, String>;
}

/// Re-prints the program with oxc, minified for build targets.
pub struct OxcTransformer;

impl Transformer for OxcTransformer {
    fn name(&self) -> &str {
        "oxc"
    }

    fn transform(
        &self,
        source: &str,
        filename: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, String> {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, source, SourceType::default().with_module(false)).parse();
        if ret.panicked || !ret.errors.is_empty() {
            return Err(ret
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "parser aborted".to_string()));
        }

        let ret = Codegen::new()
            .with_options(CodegenOptions {
                minify: options.minify,
                source_map_path: options.source_map.then(|| PathBuf::from(filename)),
                ..CodegenOptions::default()
            })
            .build(&ret.program);

        Ok(TransformOutput {
            code: ret.code,
            map: ret.map.map(|map| map.to_json_string()),
        })
    }
}

/// Emits the source unchanged.
pub struct PassthroughTransformer;

impl Transformer for PassthroughTransformer {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn transform(
        &self,
        source: &str,
        filename: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, String> {
        Ok(TransformOutput {
            code: source.to_string(),
            map: options.source_map.then(|| identity_source_map(filename, source)),
        })
    }
}

/// Identity v3 map: every generated line starts at the same line of the
/// source.
fn identity_source_map(filename: &str, source: &str) -> String {
    let lines = source.split('\n').count();
    let mut mappings = String::from("AAAA");
    for _ in 1..lines {
        // Same column, same source, next source line.
        mappings.push_str(";AACA");
    }
    serde_json::json!({
        "version": 3,
        "file": filename.rsplit(['/', '\\']).next().unwrap_or(filename),
        "sources": [filename],
        "sourcesContent": [source],
        "names": [],
        "mappings": mappings,
    })
    .to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

pub type TransformerFactory = fn() -> Arc<dyn Transformer>;

#[derive(Clone)]
pub struct TransformerRegistry {
    factories: BTreeMap<String, TransformerFactory>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: TransformerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transformer>, NotFoundError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| NotFoundError::new("transformer", name))
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("oxc", || -> Arc<dyn Transformer> { Arc::new(OxcTransformer) });
        registry.register("passthrough", || -> Arc<dyn Transformer> {
            Arc::new(PassthroughTransformer)
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oxc_minify() {
        let source = "qx.Class.define(\"app.A\", {\n  members: {\n    f: function () { return 1 + 2; }\n  }\n});\n";
        let full = OxcTransformer
            .transform(source, "app/A.js", &TransformOptions::default())
            .unwrap();
        let min = OxcTransformer
            .transform(
                source,
                "app/A.js",
                &TransformOptions {
                    minify: true,
                    source_map: true,
                },
            )
            .unwrap();
        assert!(full.code.contains("app.A"));
        assert!(min.code.len() < full.code.len());
        assert!(full.map.is_none());
        let map: serde_json::Value = serde_json::from_str(&min.map.unwrap()).unwrap();
        assert_eq!(map["version"], 3);
        assert!(!map["sources"].as_array().unwrap().is_empty());
        assert!(!map["mappings"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_passthrough_map_is_line_identity() {
        let out = PassthroughTransformer
            .transform(
                "a();\nb();\nc();",
                "app/A.js",
                &TransformOptions {
                    minify: false,
                    source_map: true,
                },
            )
            .unwrap();
        let map: serde_json::Value = serde_json::from_str(&out.map.unwrap()).unwrap();
        assert_eq!(map["mappings"], "AAAA;AACA;AACA");
        assert_eq!(map["file"], "A.js");
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        assert!(OxcTransformer
            .transform("function (", "bad.js", &TransformOptions::default())
            .is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TransformerRegistry::default();
        assert_eq!(registry.get("oxc").unwrap().name(), "oxc");
        let err = registry.get("babel").err().unwrap();
        assert_eq!(err.kind, "transformer");
    }
}

//! Node entry points.

use napi_derive::napi;
use std::path::Path;

use crate::compiler::Compiler;
use crate::config::CompilerConfig;
use crate::meta_parser::parse_class_source;

/// Run a full compile for the `compile.json` at `config_path`.
#[napi]
pub async fn compile_project_native(config_path: String) -> napi::Result<serde_json::Value> {
    let config = CompilerConfig::load(Path::new(&config_path))
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    let outcome = Compiler::new(config)
        .run()
        .await
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_value(outcome).map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Extract class metadata from one source file's text.
#[napi]
pub fn parse_class_meta_native(source: String, file_path: String) -> napi::Result<serde_json::Value> {
    let output = parse_class_source(&source, &file_path, None)
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    Ok(serde_json::json!({
        "meta": output.record,
        "warnings": output.warnings,
    }))
}

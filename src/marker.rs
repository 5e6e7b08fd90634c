//! Compile markers: warnings and errors attached to a specific class after it
//! parsed successfully.

use serde::{Deserialize, Serialize};

use crate::class_meta::SourceLocation;

// ═══════════════════════════════════════════════════════════════════════════════
// MARKER CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const MARKER_UNRESOLVED_SYMBOL: &str = "QXC-UNRESOLVED";
pub const MARKER_DEPRECATED_CLASS: &str = "QXC-DEPRECATED";
pub const MARKER_TRANSFORM_FAILED: &str = "QXC-TRANSFORM";
pub const MARKER_DUPLICATE_DEFINITION: &str = "QXC-DUPLICATE-DEFINE";
pub const MARKER_CLASSNAME_MISMATCH: &str = "QXC-CLASSNAME";
pub const MARKER_MISSING_CLASS: &str = "QXC-MISSING-CLASS";

fn describe(code: &str) -> &'static str {
    match code {
        MARKER_UNRESOLVED_SYMBOL => "Symbols under a known namespace must resolve to a class or package.",
        MARKER_DEPRECATED_CLASS => "The referenced class is marked @deprecated.",
        MARKER_TRANSFORM_FAILED => "The code generation backend rejected this class.",
        MARKER_DUPLICATE_DEFINITION => "Only the first definition in a file is used.",
        MARKER_CLASSNAME_MISMATCH => "The declared classname should match the file path.",
        MARKER_MISSING_CLASS => "A required class has no source file in any library.",
        _ => "Unknown marker.",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MarkerLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileMarker {
    pub code: String,
    pub level: MarkerLevel,
    pub message: String,
    pub description: String,
    pub classname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl CompileMarker {
    pub fn new(code: &str, level: MarkerLevel, classname: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            level,
            message: message.into(),
            description: describe(code).to_string(),
            classname: classname.to_string(),
            location: None,
        }
    }

    pub fn warning(code: &str, classname: &str, message: impl Into<String>) -> Self {
        Self::new(code, MarkerLevel::Warning, classname, message)
    }

    pub fn error(code: &str, classname: &str, message: impl Into<String>) -> Self {
        Self::new(code, MarkerLevel::Error, classname, message)
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == MarkerLevel::Error
    }
}

impl std::fmt::Display for CompileMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(
                f,
                "{} [{}:{}] {}: {}",
                self.classname, loc.line, loc.column, self.code, self.message
            ),
            None => write!(f, "{} {}: {}", self.classname, self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_display_includes_location() {
        let marker = CompileMarker::warning(MARKER_UNRESOLVED_SYMBOL, "app.Main", "app.Missing")
            .at(SourceLocation { line: 3, column: 7 });
        assert_eq!(marker.to_string(), "app.Main [3:7] QXC-UNRESOLVED: app.Missing");
        assert!(!marker.is_error());
        assert!(marker.description.contains("known namespace"));
    }

    #[test]
    fn test_marker_levels_order() {
        assert!(MarkerLevel::Error > MarkerLevel::Warning);
        assert!(MarkerLevel::Warning > MarkerLevel::Info);
    }
}

//! # qooxdoo Class Compiler (native)
//!
//! Incremental compiler for `qx.Class.define` style class libraries.
//!
//! ## Pipeline
//!
//! 1. **Libraries**: every configured directory carries a `Manifest.json`
//!    naming its namespace, version and requirements.
//! 2. **Discovery**: class roots are scanned (and optionally watched);
//!    `app/ui/Button.js` is the class `app.ui.Button`.
//! 3. **Metadata**: each class file is parsed into a `ClassRecord` and the
//!    `MetaDatabase` reconciles records across the class hierarchy.
//! 4. **Compilation**: per target, the `Analyser` expands application roots
//!    into their dependency closure; the `Controller` compiles each class at
//!    most once at a time, through worker threads or inline.
//! 5. **Output**: the `Maker` partitions the closure into parts and packages
//!    and its `Target` writes the application.
//!
//! ## Incrementality
//!
//! - Compiled classes are reused while their source mtime is unchanged.
//! - A change of libraries, environment or compiler version erases a
//!   target's output.
//! - Applications are only rewritten when one of their classes was
//!   recompiled or a local module changed.

#[cfg(feature = "napi")]
mod bindings;

pub mod analyser;
pub mod application;
pub mod backend;
pub mod cache;
pub mod class_compiler;
pub mod class_graph;
pub mod class_meta;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod jsdoc;
pub mod library;
pub mod logging;
pub mod maker;
pub mod marker;
pub mod meta_db;
pub mod meta_parser;
pub mod package;
pub mod pool;
pub mod resources;
pub mod server;
pub mod target;
pub mod transformer;
pub mod translation;
pub mod worker;

#[cfg(test)]
mod controller_tests;

#[cfg(feature = "napi")]
pub use bindings::{compile_project_native, parse_class_meta_native};

pub use class_meta::{ClassRecord, ClassType};
pub use compiler::{Compiler, RunOutcome};
pub use config::CompilerConfig;
pub use controller::Controller;
pub use error::{
    CompileFailure, CompilerError, ConfigurationError, DependencyVersionError, NotFoundError, ParseError,
};
pub use events::{CompilerEvent, EventBus};
pub use logging::init_logging;
pub use marker::{CompileMarker, MarkerLevel};
pub use meta_db::{MetaDatabase, MetaSnapshot};
pub use meta_parser::{parse_class_file, parse_class_source};
pub use server::{serve, RemoteCompiler};
pub use target::{Target, TargetRegistry};
pub use transformer::{Transformer, TransformerRegistry};

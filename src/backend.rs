//! Where class compiles run.
//!
//! The controller talks to a `CompileBackend`: the worker pool in normal
//! runs, or an inline backend that compiles on the blocking thread pool.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::class_compiler::{compile_class, CompileRequest, CompiledClassInfo};
use crate::error::{CompileFailure, PoolError};
use crate::meta_db::MetaSnapshot;
use crate::pool::TranspilerPool;
use crate::transformer::Transformer;
use crate::worker::{METHOD_COMPILE_CLASS, METHOD_SET_META_SNAPSHOT};

#[async_trait]
pub trait CompileBackend: Send + Sync {
    /// Install the metadata every following compile resolves symbols against.
    async fn update_snapshot(&self, snapshot: Arc<MetaSnapshot>) -> Result<(), PoolError>;

    async fn compile(&self, request: CompileRequest) -> Result<CompiledClassInfo, CompileFailure>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════════

pub struct PoolBackend {
    pool: Arc<TranspilerPool>,
}

impl PoolBackend {
    pub fn new(pool: Arc<TranspilerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<TranspilerPool> {
        &self.pool
    }
}

#[async_trait]
impl CompileBackend for PoolBackend {
    async fn update_snapshot(&self, snapshot: Arc<MetaSnapshot>) -> Result<(), PoolError> {
        // Serialized once; every worker parses the same text.
        let json = snapshot
            .to_json()
            .map_err(|e| PoolError::Snapshot(e.to_string()))?;
        loop {
            self.pool.wait_all_ready().await?;
            match self
                .pool
                .call_all(METHOD_SET_META_SNAPSHOT, vec![Value::String(json.clone())])
                .await
            {
                Err(PoolError::WorkersBusy { busy }) => {
                    tracing::debug!(busy, "workers picked up new calls, retrying snapshot broadcast");
                }
                other => return other.map(|_| ()),
            }
        }
    }

    async fn compile(&self, request: CompileRequest) -> Result<CompiledClassInfo, CompileFailure> {
        let classname = request.classname.clone();
        let args = vec![serde_json::to_value(&request)
            .map_err(|e| CompileFailure::new(&classname, e.to_string()))?];
        let value = self
            .pool
            .call_method(METHOD_COMPILE_CLASS, args)
            .await
            .map_err(|e| match e {
                PoolError::Method { message, .. } => CompileFailure::new(&classname, message),
                other => CompileFailure::new(&classname, other.to_string()),
            })?;
        serde_json::from_value(value).map_err(|e| CompileFailure::new(&classname, e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INLINE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct InlineBackend {
    snapshot: RwLock<Arc<MetaSnapshot>>,
    transformer: Arc<dyn Transformer>,
}

impl InlineBackend {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(MetaSnapshot::default())),
            transformer,
        }
    }
}

#[async_trait]
impl CompileBackend for InlineBackend {
    async fn update_snapshot(&self, snapshot: Arc<MetaSnapshot>) -> Result<(), PoolError> {
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    async fn compile(&self, request: CompileRequest) -> Result<CompiledClassInfo, CompileFailure> {
        let snapshot = self.snapshot.read().clone();
        let transformer = self.transformer.clone();
        let classname = request.classname.clone();
        tokio::task::spawn_blocking(move || compile_class(&request, snapshot.as_ref(), transformer.as_ref()))
            .await
            .map_err(|e| CompileFailure::new(&classname, format!("compile task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_meta::{ClassRecord, ClassType};
    use crate::events::EventBus;
    use crate::transformer::PassthroughTransformer;
    use std::fs;

    fn request(dir: &std::path::Path) -> CompileRequest {
        let source = dir.join("Main.js");
        fs::write(
            &source,
            "qx.Class.define(\"app.Main\", {\n  extend: qx.core.Object\n});\n",
        )
        .unwrap();
        CompileRequest {
            classname: "app.Main".into(),
            source_path: source,
            output_dir: dir.join("out"),
            minify: false,
        }
    }

    fn snapshot() -> Arc<MetaSnapshot> {
        let mut snapshot = MetaSnapshot::default();
        snapshot.classes.insert(
            "qx.core.Object".into(),
            ClassRecord::new("qx.core.Object", ClassType::Class),
        );
        Arc::new(snapshot)
    }

    #[tokio::test]
    async fn test_pool_and_inline_backends_agree() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(dir.path());

        let pool = Arc::new(
            TranspilerPool::new(Some(2), Arc::new(PassthroughTransformer), EventBus::new()).unwrap(),
        );
        let pooled = PoolBackend::new(pool);
        pooled.update_snapshot(snapshot()).await.unwrap();
        let from_pool = pooled.compile(request.clone()).await.unwrap();

        let inline = InlineBackend::new(Arc::new(PassthroughTransformer));
        inline.update_snapshot(snapshot()).await.unwrap();
        let from_inline = inline.compile(request).await.unwrap();

        assert_eq!(from_pool.hash, from_inline.hash);
        assert!(from_pool.load_deps().any(|c| c == "qx.core.Object"));
        assert_eq!(from_pool.depends_on, from_inline.depends_on);
    }

    #[tokio::test]
    async fn test_missing_source_is_a_compile_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InlineBackend::new(Arc::new(PassthroughTransformer));
        let failure = backend
            .compile(CompileRequest {
                classname: "app.Gone".into(),
                source_path: dir.path().join("Gone.js"),
                output_dir: dir.path().join("out"),
                minify: false,
            })
            .await
            .unwrap_err();
        assert_eq!(failure.classname, "app.Gone");
    }
}

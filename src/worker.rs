//! Transpiler worker and the message envelope it speaks.
//!
//! The envelope is shared with the compiler server:
//! `{type:"callMethod",methodName,args,callId}` is answered by
//! `{type:"methodReturn",result|error,callId}`, and `{type:"event",event,data}`
//! carries unsolicited progress. A worker announces `ready` once at startup
//! and again after every call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::class_compiler::{compile_class, CompileRequest};
use crate::meta_db::MetaSnapshot;
use crate::transformer::Transformer;

pub const METHOD_SET_META_SNAPSHOT: &str = "setMetaSnapshot";
pub const METHOD_COMPILE_CLASS: &str = "compileClass";
pub const METHOD_PING: &str = "ping";
pub const EVENT_READY: &str = "ready";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    CallMethod {
        method_name: String,
        #[serde(default)]
        args: Vec<Value>,
        call_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    MethodReturn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        call_id: u64,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl WorkerMessage {
    pub fn call(method_name: &str, args: Vec<Value>, call_id: u64) -> Self {
        WorkerMessage::CallMethod {
            method_name: method_name.to_string(),
            args,
            call_id,
        }
    }

    pub fn method_return(call_id: u64, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => WorkerMessage::MethodReturn {
                result: Some(result),
                error: None,
                call_id,
            },
            Err(error) => WorkerMessage::MethodReturn {
                result: None,
                error: Some(error),
                call_id,
            },
        }
    }

    pub fn event(event: &str, data: Value) -> Self {
        WorkerMessage::Event {
            event: event.to_string(),
            data,
        }
    }

    pub fn ready() -> Self {
        Self::event(EVENT_READY, Value::Null)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerMessage::Event { event, .. } if event == EVENT_READY)
    }
}

/// Executes calls against the most recently broadcast metadata snapshot.
pub struct TranspilerWorker {
    id: usize,
    snapshot: Arc<MetaSnapshot>,
    transformer: Arc<dyn Transformer>,
}

impl TranspilerWorker {
    pub fn new(id: usize, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            id,
            snapshot: Arc::new(MetaSnapshot::default()),
            transformer,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle one envelope. Only calls produce a reply. A panic inside the
    /// call is reported as that call's error and the worker keeps serving.
    pub fn dispatch(&mut self, message: WorkerMessage) -> Option<WorkerMessage> {
        let WorkerMessage::CallMethod {
            method_name,
            args,
            call_id,
        } = message
        else {
            return None;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| self.call_method(&method_name, args)))
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(worker = self.id, method = %method_name, %message, "worker call panicked");
                Err(format!("worker panicked: {}", message))
            });
        Some(WorkerMessage::method_return(call_id, outcome))
    }

    fn call_method(&mut self, method: &str, args: Vec<Value>) -> Result<Value, String> {
        match method {
            METHOD_SET_META_SNAPSHOT => {
                let snapshot = match args.into_iter().next() {
                    Some(Value::String(json)) => MetaSnapshot::from_json(&json),
                    Some(value) => serde_json::from_value(value),
                    None => return Err("setMetaSnapshot needs a snapshot".to_string()),
                }
                .map_err(|e| format!("invalid snapshot: {}", e))?;
                tracing::debug!(worker = self.id, classes = snapshot.classes.len(), "snapshot installed");
                self.snapshot = Arc::new(snapshot);
                Ok(Value::Bool(true))
            }
            METHOD_COMPILE_CLASS => {
                let request: CompileRequest = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| "compileClass needs a request".to_string())
                    .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))?;
                let info = compile_class(&request, self.snapshot.as_ref(), self.transformer.as_ref())
                    .map_err(|failure| failure.message)?;
                serde_json::to_value(info).map_err(|e| e.to_string())
            }
            METHOD_PING => Ok(Value::String("pong".to_string())),
            other => Err(format!("unknown method {}", other)),
        }
    }
}

//! Transpiler Pool
//!
//! A fixed set of worker threads behind one dispatcher thread. Workers speak
//! the `WorkerMessage` envelope over crossbeam channels: calls go out to a
//! single worker, replies and `ready` events come back to the dispatcher,
//! which routes replies by call id and hands queued calls to whichever
//! worker became ready first.

use crossbeam::channel::{self, Receiver, Sender};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{oneshot, watch};

use crate::error::PoolError;
use crate::events::{CompilerEvent, EventBus};
use crate::transformer::Transformer;
use crate::worker::{TranspilerWorker, WorkerMessage};

/// One worker per CPU, keeping a core for the orchestrating runtime.
pub fn default_size() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

type Reply = oneshot::Sender<Result<Value, PoolError>>;

struct PendingCall {
    method: String,
    reply: Reply,
}

#[derive(Debug, Clone, Copy, Default)]
struct PoolStatus {
    ready: usize,
    closed: bool,
}

struct PoolState {
    workers: Vec<Sender<WorkerMessage>>,
    ready: VecDeque<usize>,
    queue: VecDeque<WorkerMessage>,
    pending: HashMap<u64, PendingCall>,
    closed: bool,
}

struct PoolInner {
    size: usize,
    state: Mutex<PoolState>,
    status: watch::Sender<PoolStatus>,
    next_call_id: AtomicU64,
    events: EventBus,
}

pub struct TranspilerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TranspilerPool {
    pub fn new(
        size: Option<usize>,
        transformer: Arc<dyn Transformer>,
        events: EventBus,
    ) -> std::io::Result<Self> {
        let size = size.unwrap_or_else(default_size).max(1);
        let (to_dispatcher, from_workers) = channel::unbounded::<(usize, WorkerMessage)>();

        let mut threads = Vec::with_capacity(size + 1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let (tx, rx) = channel::unbounded::<WorkerMessage>();
            let out = to_dispatcher.clone();
            let worker = TranspilerWorker::new(id, transformer.clone());
            let handle = thread::Builder::new()
                .name(format!("qxc-worker-{}", id))
                .spawn(move || worker_loop(worker, rx, out))?;
            workers.push(tx);
            threads.push(handle);
        }
        drop(to_dispatcher);

        let (status, _) = watch::channel(PoolStatus::default());
        let inner = Arc::new(PoolInner {
            size,
            state: Mutex::new(PoolState {
                workers,
                ready: VecDeque::with_capacity(size),
                queue: VecDeque::new(),
                pending: HashMap::new(),
                closed: false,
            }),
            status,
            next_call_id: AtomicU64::new(1),
            events,
        });

        let dispatcher = inner.clone();
        threads.push(
            thread::Builder::new()
                .name("qxc-pool-dispatch".to_string())
                .spawn(move || dispatch_loop(dispatcher, from_workers))?,
        );

        tracing::info!(workers = size, "transpiler pool started");
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn ready_workers(&self) -> usize {
        self.inner.status.borrow().ready
    }

    /// Run `method` on the next ready worker. Calls queue in FIFO order while
    /// every worker is busy.
    pub async fn call_method(&self, method: &str, args: Vec<Value>) -> Result<Value, PoolError> {
        let reply = self.inner.submit(method, args)?;
        reply.await.unwrap_or(Err(PoolError::Closed))
    }

    /// Run `method` once on every worker. Fails without sending anything when
    /// a worker is busy, so a broadcast never interleaves with queued work.
    pub async fn call_all(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, PoolError> {
        let replies = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if state.ready.len() < self.inner.size {
                return Err(PoolError::WorkersBusy {
                    busy: self.inner.size - state.ready.len(),
                });
            }
            let workers: Vec<usize> = state.ready.drain(..).collect();
            let replies: Vec<_> = workers
                .into_iter()
                .map(|worker| {
                    let (message, reply) = self.inner.register(&mut state, method, args.clone());
                    self.inner.send_to(&mut state, worker, message);
                    reply
                })
                .collect();
            self.inner.publish(&state);
            replies
        };

        join_all(replies)
            .await
            .into_iter()
            .map(|reply| reply.unwrap_or(Err(PoolError::Closed)))
            .collect()
    }

    /// Resolves once every worker is idle.
    pub async fn wait_all_ready(&self) -> Result<(), PoolError> {
        let size = self.inner.size;
        let mut status = self.inner.status.subscribe();
        let reached = status
            .wait_for(|s| s.closed || s.ready >= size)
            .await
            .map_err(|_| PoolError::Closed)?;
        if reached.closed {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    /// Fail outstanding calls, close the worker channels and join every
    /// thread. Workers finish the call they are running first.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.closed = true;
                state.workers.clear();
                state.queue.clear();
                state.ready.clear();
                for (_, pending) in state.pending.drain() {
                    let _ = pending.reply.send(Err(PoolError::Closed));
                }
                self.inner.publish(&state);
                tracing::info!("transpiler pool shutting down");
            }
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("pool thread exited with a panic");
            }
        }
    }
}

impl Drop for TranspilerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCH
// ═══════════════════════════════════════════════════════════════════════════════

impl PoolInner {
    fn submit(&self, method: &str, args: Vec<Value>) -> Result<oneshot::Receiver<Result<Value, PoolError>>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let (message, reply) = self.register(&mut state, method, args);
        match state.ready.pop_front() {
            Some(worker) => self.send_to(&mut state, worker, message),
            None => state.queue.push_back(message),
        }
        self.publish(&state);
        Ok(reply)
    }

    fn register(
        &self,
        state: &mut PoolState,
        method: &str,
        args: Vec<Value>,
    ) -> (WorkerMessage, oneshot::Receiver<Result<Value, PoolError>>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            call_id,
            PendingCall {
                method: method.to_string(),
                reply: tx,
            },
        );
        (WorkerMessage::call(method, args, call_id), rx)
    }

    fn send_to(&self, state: &mut PoolState, worker: usize, message: WorkerMessage) {
        let call_id = match &message {
            WorkerMessage::CallMethod { call_id, .. } => *call_id,
            _ => return,
        };
        let delivered = state
            .workers
            .get(worker)
            .is_some_and(|tx| tx.send(message).is_ok());
        if !delivered {
            tracing::error!(worker, call_id, "worker channel closed");
            if let Some(pending) = state.pending.remove(&call_id) {
                let _ = pending.reply.send(Err(PoolError::Closed));
            }
        }
    }

    fn publish(&self, state: &PoolState) {
        self.status.send_replace(PoolStatus {
            ready: state.ready.len(),
            closed: state.closed,
        });
    }

    fn worker_ready(&self, worker: usize) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        match state.queue.pop_front() {
            Some(message) => self.send_to(&mut state, worker, message),
            None => state.ready.push_back(worker),
        }
        self.publish(&state);
    }

    fn complete(&self, worker: usize, call_id: u64, result: Option<Value>, error: Option<String>) {
        let Some(pending) = self.state.lock().pending.remove(&call_id) else {
            tracing::debug!(worker, call_id, "reply for an abandoned call");
            return;
        };
        let outcome = match error {
            Some(message) => Err(PoolError::Method {
                worker,
                method: pending.method,
                message,
            }),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        // The caller may have stopped waiting.
        let _ = pending.reply.send(outcome);
    }
}

fn worker_loop(mut worker: TranspilerWorker, jobs: Receiver<WorkerMessage>, out: Sender<(usize, WorkerMessage)>) {
    let id = worker.id();
    if out.send((id, WorkerMessage::ready())).is_err() {
        return;
    }
    for message in jobs.iter() {
        if let Some(reply) = worker.dispatch(message) {
            if out.send((id, reply)).is_err() {
                break;
            }
        }
        if out.send((id, WorkerMessage::ready())).is_err() {
            break;
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

fn dispatch_loop(inner: Arc<PoolInner>, from_workers: Receiver<(usize, WorkerMessage)>) {
    for (worker, message) in from_workers.iter() {
        match message {
            WorkerMessage::MethodReturn {
                result,
                error,
                call_id,
            } => inner.complete(worker, call_id, result, error),
            ready if ready.is_ready() => inner.worker_ready(worker),
            WorkerMessage::Event { event, data } => {
                inner.events.emit(CompilerEvent::Worker { event, data });
            }
            WorkerMessage::CallMethod { method_name, .. } => {
                tracing::warn!(worker, method = %method_name, "worker sent a call to the pool");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_compiler::CompileRequest;
    use crate::transformer::{PassthroughTransformer, TransformOptions, TransformOutput};
    use crate::worker::{METHOD_COMPILE_CLASS, METHOD_PING};
    use std::time::Duration;

    struct SlowTransformer;

    impl Transformer for SlowTransformer {
        fn name(&self) -> &str {
            "slow"
        }

        fn transform(&self, source: &str, _: &str, _: &TransformOptions) -> Result<TransformOutput, String> {
            thread::sleep(Duration::from_millis(300));
            Ok(TransformOutput {
                code: source.to_string(),
                map: None,
            })
        }
    }

    fn pool(size: usize, transformer: Arc<dyn Transformer>) -> TranspilerPool {
        TranspilerPool::new(Some(size), transformer, EventBus::new()).unwrap()
    }

    #[test]
    fn test_default_size_leaves_a_core() {
        assert!(default_size() >= 1);
        assert!(default_size() <= num_cpus::get().max(1));
    }

    #[tokio::test]
    async fn test_calls_queue_until_a_worker_is_ready() {
        let pool = pool(1, Arc::new(PassthroughTransformer));
        let calls = (0..4).map(|_| pool.call_method(METHOD_PING, vec![]));
        for result in join_all(calls).await {
            assert_eq!(result.unwrap(), Value::from("pong"));
        }
        pool.wait_all_ready().await.unwrap();
        assert_eq!(pool.ready_workers(), 1);
    }

    #[tokio::test]
    async fn test_worker_errors_reach_the_caller() {
        let pool = pool(2, Arc::new(PassthroughTransformer));
        let err = pool.call_method("nope", vec![]).await.unwrap_err();
        match err {
            PoolError::Method { method, message, .. } => {
                assert_eq!(method, "nope");
                assert_eq!(message, "unknown method nope");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_all_requires_idle_workers() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Slow.js");
        std::fs::write(&source, "qx.Class.define(\"app.Slow\", {});\n").unwrap();
        let request = CompileRequest {
            classname: "app.Slow".into(),
            source_path: source,
            output_dir: dir.path().join("out"),
            minify: false,
        };

        let pool = Arc::new(pool(1, Arc::new(SlowTransformer)));
        pool.wait_all_ready().await.unwrap();

        let busy = pool.clone();
        let args = vec![serde_json::to_value(&request).unwrap()];
        let compile = tokio::spawn(async move { busy.call_method(METHOD_COMPILE_CLASS, args).await });
        while pool.ready_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            pool.call_all(METHOD_PING, vec![]).await,
            Err(PoolError::WorkersBusy { busy: 1 })
        ));

        compile.await.unwrap().unwrap();
        pool.wait_all_ready().await.unwrap();
        let results = pool.call_all(METHOD_PING, vec![]).await.unwrap();
        assert_eq!(results, vec![Value::from("pong")]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_new_calls() {
        let pool = pool(2, Arc::new(PassthroughTransformer));
        pool.wait_all_ready().await.unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.call_method(METHOD_PING, vec![]).await,
            Err(PoolError::Closed)
        ));
        assert!(matches!(pool.wait_all_ready().await, Err(PoolError::Closed)));
    }
}

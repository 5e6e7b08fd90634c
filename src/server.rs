//! Compiler server
//!
//! Runs compiles on behalf of another process. Requests and replies use the
//! worker envelope, one JSON document per line. Progress is streamed as
//! `compilerEvent` events while a compile runs; every event of a compile is
//! written before its reply.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinSet;

use crate::compiler::{Compiler, RunOutcome};
use crate::config::CompilerConfig;
use crate::error::CompilerError;
use crate::events::{CompilerEvent, EventBus};
use crate::worker::{WorkerMessage, METHOD_PING};

pub const METHOD_COMPILE: &str = "compile";
pub const METHOD_STOP: &str = "stop";
pub const EVENT_COMPILER: &str = "compilerEvent";

type Running = Arc<parking_lot::Mutex<HashMap<u64, Arc<Notify>>>>;

// ═══════════════════════════════════════════════════════════════════════════════
// SERVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Serve requests from `reader` until it closes. Running compiles are asked
/// to stop at end of input and are awaited before returning.
pub async fn serve<R, W>(reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(write_messages(writer, out_rx));
    let running: Running = Arc::default();
    let mut tasks = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: WorkerMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed request");
                continue;
            }
        };
        let WorkerMessage::CallMethod {
            method_name,
            args,
            call_id,
        } = message
        else {
            continue;
        };

        match method_name.as_str() {
            METHOD_PING => {
                let _ = out_tx.send(WorkerMessage::method_return(call_id, Ok(Value::from("pong"))));
            }
            METHOD_STOP => {
                let stopped: Vec<Arc<Notify>> = running.lock().values().cloned().collect();
                for stop in &stopped {
                    stop.notify_one();
                }
                let _ = out_tx.send(WorkerMessage::method_return(call_id, Ok(Value::from(stopped.len()))));
            }
            METHOD_COMPILE => {
                let out = out_tx.clone();
                let running = running.clone();
                tasks.spawn(async move {
                    let outcome = run_compile(call_id, args, &out, &running).await;
                    running.lock().remove(&call_id);
                    let _ = out.send(WorkerMessage::method_return(call_id, outcome));
                });
            }
            other => {
                let _ = out_tx.send(WorkerMessage::method_return(
                    call_id,
                    Err(format!("unknown method {}", other)),
                ));
            }
        }
    }

    tracing::debug!("server input closed");
    for stop in running.lock().values() {
        stop.notify_one();
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "compile task failed");
        }
    }
    drop(out_tx);
    writer_task.await.map_err(std::io::Error::other)?
}

async fn write_messages<W>(mut writer: W, mut messages: mpsc::UnboundedReceiver<WorkerMessage>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_string(&message).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// `compile(config, projectDir)`
async fn run_compile(
    call_id: u64,
    args: Vec<Value>,
    out: &mpsc::UnboundedSender<WorkerMessage>,
    running: &Running,
) -> Result<Value, String> {
    let mut args = args.into_iter();
    let config = args.next().ok_or("compile needs a configuration")?;
    let project_dir = args
        .next()
        .and_then(|v| v.as_str().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = CompilerConfig::from_json(config, &project_dir).map_err(|e| e.to_string())?;
    // Never delegate again from inside the server.
    config.server = None;

    let compiler = Compiler::new(config);
    running.lock().insert(call_id, compiler.stop_handle());
    let mut events = compiler.events().subscribe();
    let forward = |event: CompilerEvent| match serde_json::to_value(&event) {
        Ok(data) => {
            let _ = out.send(WorkerMessage::event(EVENT_COMPILER, data));
        }
        Err(e) => tracing::warn!(error = %e, "cannot forward event"),
    };

    let run = compiler.run();
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => forward(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            },
            result = &mut run => break Some(result),
        }
    };
    let result = match result {
        Some(result) => result,
        None => run.await,
    };
    loop {
        match events.try_recv() {
            Ok(event) => forward(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let outcome = result.map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

/// A compiler server running as a child process.
pub struct RemoteCompiler {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    next_call_id: AtomicU64,
}

impl RemoteCompiler {
    /// Start `command` (program then arguments) in `cwd`.
    pub fn spawn(command: &[String], cwd: &Path) -> Result<Self, CompilerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CompilerError::Remote("empty server command".to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CompilerError::Remote("server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CompilerError::Remote("server stdout unavailable".to_string()))?;
        tracing::info!(program = %program, "started compiler server");
        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            next_call_id: AtomicU64::new(1),
        })
    }

    /// Send one call and wait for its reply, re-emitting server events on
    /// `events`. Calls are answered one at a time.
    pub async fn call(&self, method: &str, args: Vec<Value>, events: &EventBus) -> Result<Value, CompilerError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let mut stdout = self.stdout.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| CompilerError::Remote("server connection closed".to_string()))?;
            let mut line = serde_json::to_string(&WorkerMessage::call(method, args, call_id))
                .map_err(|e| CompilerError::Remote(e.to_string()))?;
            line.push('\n');
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        while let Some(line) = stdout.next_line().await? {
            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::MethodReturn {
                    result,
                    error,
                    call_id: id,
                }) if id == call_id => {
                    return match error {
                        Some(error) => Err(CompilerError::Remote(error)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                }
                Ok(WorkerMessage::Event { event, data }) => relay_event(events, event, data),
                Ok(other) => tracing::debug!(?other, "ignoring unexpected server message"),
                Err(e) => tracing::warn!(error = %e, "malformed server output"),
            }
        }
        Err(CompilerError::Remote("server exited before replying".to_string()))
    }

    pub async fn ping(&self) -> Result<(), CompilerError> {
        self.call(METHOD_PING, Vec::new(), &EventBus::new()).await.map(|_| ())
    }

    pub async fn compile(&self, config: &CompilerConfig, events: &EventBus) -> Result<RunOutcome, CompilerError> {
        let config_json = serde_json::to_value(config).map_err(|e| CompilerError::Remote(e.to_string()))?;
        let project_dir = Value::from(config.project_dir.to_string_lossy().into_owned());
        let result = self.call(METHOD_COMPILE, vec![config_json, project_dir], events).await?;
        serde_json::from_value(result).map_err(|e| CompilerError::Remote(e.to_string()))
    }

    /// Close the server's input and wait for it to exit, killing it if it
    /// takes too long.
    pub async fn shutdown(&self) {
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "compiler server exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "cannot wait for compiler server"),
            Err(_) => {
                tracing::warn!("compiler server did not exit, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "cannot kill compiler server");
                }
            }
        }
    }
}

fn relay_event(events: &EventBus, event: String, data: Value) {
    if event == EVENT_COMPILER {
        match serde_json::from_value::<CompilerEvent>(data) {
            Ok(event) => events.emit(event),
            Err(e) => tracing::warn!(error = %e, "unknown compiler event"),
        }
    } else {
        events.emit(CompilerEvent::Worker { event, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tokio::io::{duplex, AsyncReadExt};

    async fn exchange(requests: &[WorkerMessage]) -> Vec<WorkerMessage> {
        let (client, server) = duplex(1 << 16);
        let (server_read, server_write) = tokio::io::split(server);
        let handle = tokio::spawn(serve(BufReader::new(server_read), server_write));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        for request in requests {
            let mut line = serde_json::to_string(request).unwrap();
            line.push('\n');
            client_write.write_all(line.as_bytes()).await.unwrap();
        }
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        handle.await.unwrap().unwrap();
        output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn reply(messages: &[WorkerMessage], id: u64) -> &WorkerMessage {
        messages
            .iter()
            .find(|m| matches!(m, WorkerMessage::MethodReturn { call_id, .. } if *call_id == id))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let messages = exchange(&[
            WorkerMessage::call("ping", vec![], 1),
            WorkerMessage::call("explode", vec![], 2),
        ])
        .await;
        assert!(matches!(
            reply(&messages, 1),
            WorkerMessage::MethodReturn { result: Some(v), .. } if v == "pong"
        ));
        assert!(matches!(
            reply(&messages, 2),
            WorkerMessage::MethodReturn { error: Some(e), .. } if e.contains("explode")
        ));
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_reported() {
        let messages = exchange(&[WorkerMessage::call(METHOD_COMPILE, vec![json!({ "targets": [] })], 7)]).await;
        assert!(matches!(
            reply(&messages, 7),
            WorkerMessage::MethodReturn { error: Some(e), .. } if e.contains("No targets")
        ));
    }

    #[tokio::test]
    async fn test_compile_streams_events_before_reply() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(
            root.join("Manifest.json"),
            r#"{ "info": { "name": "app", "version": "1.0.0" }, "provides": { "namespace": "app" } }"#,
        )
        .unwrap();
        fs::create_dir_all(root.join("source/class/app")).unwrap();
        fs::write(
            root.join("source/class/app/Main.js"),
            "qx.Class.define(\"app.Main\", {\n  members: {\n    run() { return 1; }\n  }\n});\n",
        )
        .unwrap();

        let config = json!({
            "targets": [{ "type": "source", "outputPath": "compiled/source" }],
            "applications": [{ "class": "app.Main" }],
            "workers": 0
        });
        let messages = exchange(&[WorkerMessage::call(
            METHOD_COMPILE,
            vec![config, Value::from(root.to_string_lossy().into_owned())],
            3,
        )])
        .await;

        let reply_at = messages
            .iter()
            .position(|m| matches!(m, WorkerMessage::MethodReturn { .. }))
            .unwrap();
        let finished_at = messages
            .iter()
            .position(|m| matches!(m, WorkerMessage::Event { data, .. } if data["event"] == "makeFinished"))
            .unwrap();
        assert!(finished_at < reply_at);

        let WorkerMessage::MethodReturn { result: Some(result), .. } = &messages[reply_at] else {
            panic!("compile failed: {:?}", messages[reply_at]);
        };
        let outcome: RunOutcome = serde_json::from_value(result.clone()).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.applications_built, vec!["main"]);
        assert!(root.join("compiled/source/main/index.js").is_file());
    }
}

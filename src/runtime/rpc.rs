//! Agent runtime backed by a CLI running in JSON-lines RPC mode.
//!
//! Commands go to the child's stdin one JSON object per line; events come
//! back on stdout the same way. A run ends with `agent_end`, or with a
//! failed `response` to the prompt command.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use super::{AgentRuntime, AgentSession, RuntimeError, RuntimeEvent, RuntimeEventSink};
use crate::cli::{AgentConfig, BuiltCommand, CliRegistry};
use crate::session::SessionOptions;

/// Launches one CLI child process per session
pub struct RpcRuntime {
    registry: CliRegistry,
    cli: String,
}

impl RpcRuntime {
    pub fn new(registry: CliRegistry, cli: impl Into<String>) -> Self {
        Self {
            registry,
            cli: cli.into(),
        }
    }
}

impl AgentRuntime for RpcRuntime {
    fn create_session(
        &self,
        options: SessionOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn AgentSession>, RuntimeError>> {
        let built = self
            .registry
            .build_command(&AgentConfig {
                cli: self.cli.clone(),
                model: options.model.clone(),
                thinking_level: options.thinking_level.clone(),
                flags: Vec::new(),
            })
            .map_err(|e| RuntimeError::Spawn(e.to_string()));

        Box::pin(async move {
            let session = RpcSession::launch(built?, &options)?;
            Ok(Arc::new(session) as Arc<dyn AgentSession>)
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RpcCommand {
    Prompt { message: String },
    Abort,
}

#[derive(Debug, Default, Deserialize)]
struct RpcUsage {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    usage: Option<RpcUsage>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RpcEvent {
    MessageStart,
    MessageEnd {
        #[serde(default)]
        message: Option<RpcMessage>,
    },
    ToolExecutionStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    AgentEnd,
    Response {
        #[serde(default)]
        command: Option<String>,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Other,
}

fn parse_event(line: &str) -> Option<RpcEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring non-RPC output line ({}): {}", e, line);
            None
        }
    }
}

/// `@path` references handed to the agent ahead of the first prompt
fn context_prefix(files: &[PathBuf]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    Some(
        files
            .iter()
            .map(|path| format!("@{}", path.display()))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

type RunResult = Result<(), RuntimeError>;

struct Shared {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    sink: Mutex<Option<RuntimeEventSink>>,
    pending: Mutex<Option<oneshot::Sender<RunResult>>>,
    context: Mutex<Option<String>>,
    aborted: AtomicBool,
}

impl Shared {
    fn emit(&self, event: RuntimeEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn settle(&self, result: RunResult) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.send(result);
        }
    }

    async fn send(&self, command: &RpcCommand) -> Result<(), RuntimeError> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| RuntimeError::Run("agent process is closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn handle(&self, event: RpcEvent) {
        match event {
            RpcEvent::MessageStart => self.emit(RuntimeEvent::MessageStart),
            RpcEvent::MessageEnd { message } => {
                let tokens = message
                    .and_then(|m| m.usage)
                    .map(|usage| usage.input + usage.output)
                    .unwrap_or(0);
                self.emit(RuntimeEvent::MessageEnd { tokens });
            }
            RpcEvent::ToolExecutionStart { tool_name, args } => {
                self.emit(RuntimeEvent::ToolCall { tool_name, args })
            }
            RpcEvent::AgentEnd => {
                if self.aborted.swap(false, Ordering::SeqCst) {
                    self.settle(Err(RuntimeError::Aborted));
                } else {
                    self.settle(Ok(()));
                }
            }
            RpcEvent::Response {
                command,
                success: false,
                error,
            } => {
                let message = error.unwrap_or_else(|| "command rejected".to_string());
                warn!("Agent rejected {:?}: {}", command, message);
                self.settle(Err(RuntimeError::Run(message)));
            }
            RpcEvent::Response { .. } | RpcEvent::Other => {}
        }
    }
}

struct RpcSession {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl RpcSession {
    fn launch(built: BuiltCommand, options: &SessionOptions) -> Result<Self, RuntimeError> {
        let mut cmd = Command::new(&built.command);
        cmd.args(&built.args)
            .envs(&built.env)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", built.command, e)))?;
        info!(
            "Launched '{}' for session '{}' in {}",
            built.command,
            options.name,
            options.cwd.display()
        );

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("agent stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = options.name.clone();
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = lines.next().await {
                    debug!("[{}] {}", name, line);
                }
            });
        }

        let shared = Arc::new(Shared {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            sink: Mutex::new(None),
            pending: Mutex::new(None),
            context: Mutex::new(context_prefix(&options.context_files)),
            aborted: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if let Some(event) = parse_event(&line) {
                            reader_shared.handle(event);
                        }
                    }
                    Err(e) => {
                        warn!("Agent stdout read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.settle(Err(RuntimeError::Run("agent process exited".to_string())));
        });

        Ok(Self { shared, reader })
    }
}

impl AgentSession for RpcSession {
    fn subscribe(&self, sink: RuntimeEventSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn prompt(&self, text: String) -> BoxFuture<'static, RunResult> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            *shared.pending.lock() = Some(tx);
            shared.aborted.store(false, Ordering::SeqCst);

            let message = match shared.context.lock().take() {
                Some(prefix) => format!("{}\n\n{}", prefix, text),
                None => text,
            };
            shared.send(&RpcCommand::Prompt { message }).await?;

            rx.await
                .unwrap_or_else(|_| Err(RuntimeError::Run("agent process exited".to_string())))
        })
    }

    fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.send(&RpcCommand::Abort).await {
                warn!("Failed to send abort: {}", e);
            }
        });
    }

    fn dispose(&self) -> BoxFuture<'static, ()> {
        let shared = Arc::clone(&self.shared);
        self.reader.abort();
        Box::pin(async move {
            shared.stdin.lock().await.take();
            if let Some(mut child) = shared.child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    debug!("Agent process already gone: {}", e);
                }
            }
            shared.settle(Err(RuntimeError::Aborted));
            shared.sink.lock().take();
        })
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AgentRuntime, AgentSession, RuntimeError, RuntimeEvent, RuntimeEventSink};
use crate::session::SessionOptions;

/// Tokens reported by every scripted message
pub(crate) const SCRIPTED_TOKENS: u64 = 42;

/// In-memory runtime whose sessions react to the prompt text:
/// - contains `needs-approval`: emits a `bash` tool call, then waits for abort
/// - contains `fail`: the run fails
/// - otherwise: one message of [`SCRIPTED_TOKENS`] tokens, then done
#[derive(Default)]
pub(crate) struct ScriptedRuntime {
    pub create_fails: bool,
    pub hang_on_dispose: bool,
    pub prompt_delay: Duration,
    pub created: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            create_fails: true,
            ..Self::default()
        })
    }

    pub fn hanging_dispose() -> Arc<Self> {
        Arc::new(Self {
            hang_on_dispose: true,
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            prompt_delay: delay,
            ..Self::default()
        })
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn create_session(
        &self,
        _options: SessionOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn AgentSession>, RuntimeError>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let result: Result<Arc<dyn AgentSession>, RuntimeError> = if self.create_fails {
            Err(RuntimeError::Spawn("agent binary not found".to_string()))
        } else {
            Ok(Arc::new(ScriptedSession {
                sink: Mutex::new(None),
                abort: Arc::new(Notify::new()),
                hang_on_dispose: self.hang_on_dispose,
                prompt_delay: self.prompt_delay,
            }))
        };
        Box::pin(async move { result })
    }
}

struct ScriptedSession {
    sink: Mutex<Option<RuntimeEventSink>>,
    abort: Arc<Notify>,
    hang_on_dispose: bool,
    prompt_delay: Duration,
}

impl AgentSession for ScriptedSession {
    fn subscribe(&self, sink: RuntimeEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn prompt(&self, text: String) -> BoxFuture<'static, Result<(), RuntimeError>> {
        let sink = self.sink.lock().clone();
        let abort = Arc::clone(&self.abort);
        let delay = self.prompt_delay;

        Box::pin(async move {
            let emit = |event: RuntimeEvent| {
                if let Some(sink) = &sink {
                    let _ = sink.send(event);
                }
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            emit(RuntimeEvent::MessageStart);

            if text.contains("needs-approval") {
                emit(RuntimeEvent::ToolCall {
                    tool_name: "bash".to_string(),
                    args: serde_json::json!({ "command": "rm -rf build" }),
                });
                abort.notified().await;
                return Err(RuntimeError::Aborted);
            }

            if text.contains("fail") {
                return Err(RuntimeError::Run("scripted failure".to_string()));
            }

            emit(RuntimeEvent::MessageEnd {
                tokens: SCRIPTED_TOKENS,
            });
            Ok(())
        })
    }

    fn abort(&self) {
        self.abort.notify_one();
    }

    fn dispose(&self) -> BoxFuture<'static, ()> {
        if self.hang_on_dispose {
            Box::pin(std::future::pending())
        } else {
            Box::pin(async {})
        }
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

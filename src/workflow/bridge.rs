use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{WorkflowContext, WorkflowStep};
use crate::notification::{NotificationKind, SessionNotification};
use crate::session::{PoolError, Session, SessionOptions, SessionPool, SessionPoolListener, SessionStatus};
use crate::templates;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("session {session_id} reported an error: {message}")]
    SessionFailed { session_id: String, message: String },
    #[error("session {0} ended before the step finished")]
    SessionEnded(String),
    #[error("{0}")]
    Step(String),
}

/// How the engine gets a step done. The engine knows nothing else about sessions.
pub trait WorkflowBridge: Send + Sync {
    fn execute_step<'a>(
        &'a self,
        step: &'a WorkflowStep,
        context: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;
}

/// Runs each step as a fresh pool session seeded with the rendered prompt
pub struct PoolBridge {
    pool: SessionPool,
}

impl PoolBridge {
    pub fn new(pool: SessionPool) -> Self {
        Self { pool }
    }
}

enum Signal {
    Updated(Session),
    Failed { session_id: String, message: String },
    Removed(String),
}

struct StepWatcher {
    signals: mpsc::UnboundedSender<Signal>,
}

impl SessionPoolListener for StepWatcher {
    fn on_session_removed(&self, session_id: &str) {
        let _ = self.signals.send(Signal::Removed(session_id.to_string()));
    }

    fn on_session_updated(&self, session: &Session) {
        let _ = self.signals.send(Signal::Updated(session.clone()));
    }

    fn on_notification(&self, notification: &SessionNotification) {
        if notification.kind == NotificationKind::Error {
            let _ = self.signals.send(Signal::Failed {
                session_id: notification.session_id.clone(),
                message: notification.message.clone(),
            });
        }
    }
}

impl WorkflowBridge for PoolBridge {
    fn execute_step<'a>(
        &'a self,
        step: &'a WorkflowStep,
        context: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let prompt = templates::render_step_prompt(step, context);
            let name = format!(
                "{}/{}",
                context.workflow_id.as_deref().unwrap_or("workflow"),
                step.id
            );

            // Listen before spawning so no event of the new session is missed
            let (tx, mut signals) = mpsc::unbounded_channel();
            let subscription = self.pool.subscribe(Arc::new(StepWatcher { signals: tx }));

            let session = match self
                .pool
                .spawn(SessionOptions::new(context.cwd.clone(), name).with_initial_prompt(prompt))
            {
                Ok(session) => session,
                Err(e) => {
                    subscription.unsubscribe();
                    return Err(e.into());
                }
            };
            info!("Step '{}' running in session {}", step.id, session.id);

            let outcome = wait_for_step(&session.id, &mut signals).await;
            subscription.unsubscribe();

            if let Err(e) = self.pool.destroy(&session.id).await {
                debug!("Session {} already gone after step '{}': {}", session.id, step.id, e);
            }
            outcome
        })
    }
}

/// Succeeds once the session has worked and gone back to idle
async fn wait_for_step(
    session_id: &str,
    signals: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<(), BridgeError> {
    let mut worked = false;

    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Updated(session) if session.id == session_id => match session.status {
                SessionStatus::Working | SessionStatus::Approval => worked = true,
                SessionStatus::Idle if worked => return Ok(()),
                SessionStatus::Shutdown => {
                    return Err(BridgeError::SessionEnded(session_id.to_string()))
                }
                _ => {}
            },
            Signal::Failed {
                session_id: failed,
                message,
            } if failed == session_id => {
                return Err(BridgeError::SessionFailed {
                    session_id: failed,
                    message,
                })
            }
            Signal::Removed(removed) if removed == session_id => {
                return Err(BridgeError::SessionEnded(removed))
            }
            _ => {}
        }
    }

    Err(BridgeError::SessionEnded(session_id.to_string()))
}

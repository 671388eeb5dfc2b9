pub mod cli;
pub mod config;
pub mod enrichment;
pub mod git;
pub mod http;
pub mod listeners;
pub mod notification;
pub mod runtime;
pub mod session;
pub mod templates;
pub mod watcher;
pub mod worker;
pub mod workflow;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::CliRegistry;
use crate::config::{ConfigError, ConfigStore};
use crate::http::state::AppState;
use crate::notification::SessionNotification;
use crate::runtime::RpcRuntime;
use crate::session::{Session, SessionPool, SessionPoolListener};
use crate::watcher::WorkflowWatcher;
use crate::workflow::{PoolBridge, WorkflowEngine};

pub use enrichment::enrich_issues;
pub use session::{SessionHandle, SessionOptions, SessionStatus};
pub use workflow::{WorkflowContext, WorkflowDefinition, WorkflowHandle};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Logs pool lifecycle for headless runs
struct LogListener;

impl SessionPoolListener for LogListener {
    fn on_session_added(&self, session: &Session) {
        info!("Session {} ('{}') added in {}", session.id, session.name, session.cwd.display());
    }

    fn on_session_removed(&self, session_id: &str) {
        info!("Session {} removed", session_id);
    }

    fn on_notification(&self, notification: &SessionNotification) {
        info!(
            "[{}] {}: {}",
            notification.kind, notification.session_name, notification.message
        );
    }
}

/// Load config, start the pool and workflow engine, serve the API when enabled,
/// and run until ctrl-c. On ctrl-c the API stops accepting requests first, then
/// every session is shut down.
pub async fn run() -> Result<(), ConfigError> {
    init_tracing();

    let store = ConfigStore::new()?;
    let config = store.load_config()?;
    config.validate()?;
    info!("Loaded config from {}", store.config_path().display());

    let runtime = Arc::new(RpcRuntime::new(
        CliRegistry::new(config.clone()),
        config.default_cli.clone(),
    ));
    let pool = SessionPool::new(runtime, config.max_concurrent)
        .with_shutdown_timeout(config.shutdown_timeout());
    let _log_subscription = pool.subscribe(Arc::new(LogListener));

    let workflows_dir = store.workflows_dir(&config);
    let engine = Arc::new(
        WorkflowEngine::new(Arc::new(PoolBridge::new(pool.clone())))
            .with_workflows_dir(&workflows_dir),
    );
    if let Err(e) = engine.discover() {
        warn!("Workflow discovery failed: {}", e);
    }

    let watched = Arc::downgrade(&engine);
    let _watcher = match WorkflowWatcher::new(&workflows_dir, move || {
        if let Some(engine) = watched.upgrade() {
            if let Err(e) = engine.discover() {
                warn!("Workflow rediscovery failed: {}", e);
            }
        }
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Not watching {}: {}", workflows_dir.display(), e);
            None
        }
    };

    let (stop_api, api_stopped) = tokio::sync::oneshot::channel::<()>();
    let server = if config.api.enabled {
        let port = config.api.port;
        info!("Starting HTTP API on port {}", port);
        let state = Arc::new(AppState::new(pool.clone(), Arc::clone(&engine)));
        let shutdown = async move {
            let _ = api_stopped.await;
        };
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(state, port, shutdown).await {
                error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }

    // Drain the API before its sessions go away
    let _ = stop_api.send(());
    if let Some(server) = server {
        if let Err(e) = server.await {
            error!("HTTP server task failed: {}", e);
        }
    }
    info!("Shutting down {} session(s)", pool.len());
    pool.shutdown_all().await;
    Ok(())
}

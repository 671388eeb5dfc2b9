use std::sync::Arc;

use crate::session::SessionPool;
use crate::workflow::WorkflowEngine;

pub struct AppState {
    pub pool: SessionPool,
    pub engine: Arc<WorkflowEngine>,
}

impl AppState {
    pub fn new(pool: SessionPool, engine: Arc<WorkflowEngine>) -> Self {
        Self { pool, engine }
    }
}

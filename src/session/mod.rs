mod handle;
mod model;
mod pool;
mod status;

pub use handle::{SessionEvent, SessionHandle, SHUTDOWN_TIMEOUT};
pub use model::{Session, SessionOptions, ToolCall};
pub use pool::{PoolError, SessionPool, SessionPoolListener};
pub use status::SessionStatus;

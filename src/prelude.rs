//! Curated re-exports for embedding applications.

pub use crate::autoscaler::AutoscalerConfig;
pub use crate::callbacks::{Callback, CallbackManager, RuntimeEvent};
pub use crate::config::RuntimeConfig;
pub use crate::coordinator::{Coordinator, WorkflowMode, WorkflowReport};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::handler::{FnHandler, HandlerRegistry, TaskHandler};
pub use crate::ledger::Ledger;
pub use crate::runtime::{Runtime, RuntimeBuilder};
pub use crate::task::{Priority, Task, TaskRequest, TaskState};
pub use crate::transport::Transport;

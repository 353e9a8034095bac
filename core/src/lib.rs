// docflow: document lifecycle workflow engine
// State-chart driven publication workflow over a hierarchical content store,
// plus a cluster-wide maintenance task queue.

pub mod action;
pub mod clock;
pub mod config;
pub mod context;
pub mod definition;
pub mod errors;
pub mod executor;
pub mod expression;
pub mod logging;
pub mod model;
pub mod queue;
pub mod registry;
pub mod store;
pub mod task;
pub mod workflow;

// Re-export commonly used types
pub use errors::{
    ConfigError, ConfigResult, DefinitionError, DefinitionResult, QueueError, QueueResult,
    StoreError, StoreResult, WorkflowError, WorkflowResult,
};

pub use clock::{Clock, ManualClock, SystemClock};

pub use config::{ConfigManager, DocflowConfig, LoggingConfig, QueueConfig, WorkflowConfig};

pub use logging::init_logging;

pub use expression::{EvalContext, EvalError, EvalResult, ExpressionEvaluator};

pub use model::{DocumentHandle, DocumentVariant, PublicationRequest, RequestType, VariantState};

pub use store::{
    ContentHandle, HandleSession, Lease, LeaseStatus, LockManager, NodeEvent, Repository,
    Session, Version,
};

pub use definition::{StateMachineDefinition, DOCUMENT_WORKFLOW};

pub use registry::DefinitionRegistry;

pub use context::WorkflowContext;

pub use action::{Action, ActionDef};

pub use task::WorkflowTask;

pub use executor::{FireOutcome, StateMachineExecutor, TransitionRecord};

pub use workflow::{ops, DocumentWorkflow};

pub use queue::{
    CycleOutcome, MaintenanceTask, QueueRunner, QueueWorker, TaskDescriptor, TaskQueue,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

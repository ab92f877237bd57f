//! Convenience re-exports for workflow authors and host integrations.

pub use crate::cancel::CancelToken;
pub use crate::config::EngineConfig;
pub use crate::context::{
	BoxFuture, BranchFn, CompletableMessage, Context, LoopOptions, LoopStep, Mode, QueueNextOptions, RollbackFn,
	StepConfig, StepCtx,
};
pub use crate::db::{HistoryNotifier, HistorySnapshot, HydratedWorkflow, MessageDriver, PersistenceDriver, ReceiveRequest};
pub use crate::error::{StructuredError, WorkflowError, WorkflowResult};
pub use crate::handle::Handle;
pub use crate::history::{BranchRecord, BranchStatus, Entry, EntryKind, MetaStatus, SleepState};
pub use crate::location::Location;
pub use crate::queue::WorkflowQueueMessage;
pub use crate::scheduler::{Engine, RunOutcome};
pub use crate::state::WorkflowState;
pub use crate::workflow::WorkflowRegistry;

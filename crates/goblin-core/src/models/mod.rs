pub mod error;
pub mod gadget;
pub mod task;

pub use error::{CoreError, CoreErrorKind};
pub use gadget::{
    ExecutionOutcome, FormSchema, GadgetDescriptor, GadgetInfo, ModeDescriptor, ModeInfo,
    OutcomeStatus, TaskParams,
};
pub use task::{
    MinionId, MinionState, StatusReport, TaskCompletion, TaskDraft, TaskId, TaskRecord, TaskStatus,
};

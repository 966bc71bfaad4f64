pub mod dispatcher;
pub mod minion_pool;
pub mod signals;

pub use dispatcher::{
    Dispatcher, DispatcherMetrics, HostUsage, HostUsageProbe, OperationReport, OperationStatus,
    SubmissionReceipt, SysinfoHostProbe,
};
pub use minion_pool::{
    CompletionHooks, ExecutionReport, MinionPool, PoolLimits, PoolSnapshot, TaskOperation,
};
pub use signals::{ExecutionSignals, SoftTimeoutSignal, TaskCancellationToken};

use std::time::Duration;

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancellationMode {
    Immediate,
    Graceful { grace_period: Duration },
}

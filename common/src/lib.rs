pub mod aggregator;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod pipeline;
pub mod pool;
pub mod records;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod step;
pub mod steps;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::{AggregateSummary, ResultAggregator, NOT_COMPUTED};
pub use error::{PoolError, RunError, StorageError};
pub use executor::{Executor, FileTask};
pub use ledger::{LedgerEntry, LedgerStatus, ProgressLedger};
pub use pipeline::{PipelineBuildError, PipelineConfig, PipelineDefinition, StepSection};
pub use pool::{local_pool, LocalPool, SequentialPool, WorkerPool};
pub use records::{FailureKind, FailureRecord, ResultRecord, TaskOutcome};
pub use registry::{RegistryError, StepRegistry};
pub use run::{RunId, RunInfo, RunRequest, RunResults, RunStatus};
pub use scheduler::{CompletionHook, RunOptions, RunSummary, Scheduler};
pub use step::{Params, RunState, Step, StepError, StepSpec};
pub use task::{Task, TaskId};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};

/// Identificador de un archivo de entrada: la ruta tal como la entregó el caller.
pub type FileId = String;

//! Task orchestration: claim ready tasks, run one worker per task, report
//! the outcome.

pub mod cancel;
pub mod event_log;
pub mod gate;
pub mod prompt;
pub mod runner;
pub mod scheduler;

pub use cancel::CancelRequests;
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use runner::{
    AgentRunner, CancelHandle, CancelReason, RunError, RunReport, RunRequest, RunState,
    RunnerConfig,
};
pub use scheduler::{
    AgentRun, OrchestratorContext, RunCompletion, Scheduler, SchedulerConfig,
};

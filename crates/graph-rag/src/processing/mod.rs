//! Background task processing: durable-queue scheduler, supervised workers,
//! and the task runner that parses, imports and exports

mod context;
mod scheduler;
mod supervisor;
mod transfer;
mod worker;

pub use context::TaskContext;
pub use scheduler::Scheduler;
pub use supervisor::{
    InProcessLauncher, ProcessLauncher, WorkerEvent, WorkerExit, WorkerHandle, WorkerLauncher,
    WorkerSupervisor,
};
pub use transfer::{ExportPayload, ImportPayload};
pub use worker::TaskRunner;

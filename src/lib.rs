//! Runs cancellable operations on a Tokio runtime under a concurrency limit,
//! tracks the ones in flight, and notifies a delegate on a chosen execution
//! context as each one finishes.

mod config;
mod context;
mod error;
mod executor;
mod job_queue;
mod operation;
mod router;
mod runner;

pub use config::RunnerConfig;
pub use context::{DeliveryJob, DispatchQueue, DispatchThread, MainContext, QueueTarget, ThreadTarget};
pub use error::RunnerError;
pub use executor::{BoundedExecutor, ExecOutcome, Priority, TaskToExecute};
pub use operation::{from_fn, FnWork, Operation, OperationId, OperationState, Work, WorkFuture};
pub use router::{Delivery, DispatchMode, DispatchRouter};
pub use runner::{OperationsRunner, RunnerDelegate};

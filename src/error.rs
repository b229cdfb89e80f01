use crate::operation::OperationId;

use thiserror::Error;

/// Errors surfaced by `OperationsRunner` at the call site.
///
/// Every variant is a contract violation by the caller. Outcomes of the
/// operations themselves are never reported here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
  #[error("Operation {0} is already registered with this runner")]
  AlreadySubmitted(OperationId),

  #[error("Operation {0} has already been admitted once and cannot be re-admitted")]
  AlreadyFinished(OperationId),

  #[error("Operation {0} appears more than once in the submitted batch")]
  DuplicateInBatch(OperationId),

  #[error("The runner's executor is shut down and cannot accept new operations")]
  ExecutorShutDown,
}

use crate::executor::TaskToExecute;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

lazy_static::lazy_static! {
  static ref NEXT_OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Process-wide unique identity of an `Operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
  fn next() -> Self {
    OperationId(NEXT_OPERATION_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
  }

  pub fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for OperationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "op-{}", self.0)
  }
}

/// Lifecycle of an operation. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperationState {
  /// Created, never handed to a runner.
  Pending = 0,
  /// Registered with a runner and waiting for an executor slot.
  Submitted = 1,
  /// The work future is being polled on an executor worker.
  Executing = 2,
  /// The work ran to its end (or panicked).
  Completed = 3,
  /// Cancellation was requested before the work ended.
  Cancelled = 4,
  /// Removed from the registry. Terminal.
  Deregistered = 5,
}

impl OperationState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => OperationState::Pending,
      1 => OperationState::Submitted,
      2 => OperationState::Executing,
      3 => OperationState::Completed,
      4 => OperationState::Cancelled,
      _ => OperationState::Deregistered,
    }
  }
}

/// The future returned by `Work::run`. It may borrow from the work value.
pub type WorkFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The user-defined body of an operation.
///
/// `run` is called at most once, on an executor worker. Implementations should
/// check `cancel` at convenient points; results are usually stored inside the
/// work value (behind a lock) so the delegate can read them from the finished
/// `Operation`.
pub trait Work: Send + Sync + 'static {
  fn run<'a>(&'a self, cancel: &'a CancellationToken) -> WorkFuture<'a>;
}

/// Adapts a closure returning a future into `Work`.
pub struct FnWork<F>(F);

impl<F, Fut> Work for FnWork<F>
where
  F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  fn run<'a>(&'a self, cancel: &'a CancellationToken) -> WorkFuture<'a> {
    Box::pin((self.0)(cancel.clone()))
  }
}

/// Builds an operation whose work is the given closure.
pub fn from_fn<F, Fut>(f: F) -> Arc<Operation<FnWork<F>>>
where
  F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  Operation::new(FnWork(f))
}

/// A cancellable unit of work that can be submitted to an `OperationsRunner`.
///
/// Operations are shared as `Arc<Operation<W>>`: the owner keeps a reference to
/// inspect it, the runner keeps one while it is registered, and the delegate
/// receives one when it finishes.
pub struct Operation<W: Work> {
  id: OperationId,
  token: CancellationToken,
  state: AtomicU8,
  tag: Mutex<Option<String>>,
  work: W,
}

impl<W: Work> Operation<W> {
  pub fn new(work: W) -> Arc<Self> {
    Arc::new(Self {
      id: OperationId::next(),
      token: CancellationToken::new(),
      state: AtomicU8::new(OperationState::Pending as u8),
      tag: Mutex::new(None),
      work,
    })
  }

  pub fn id(&self) -> OperationId {
    self.id
  }

  pub fn work(&self) -> &W {
    &self.work
  }

  /// The descriptive tag given at submission, if any.
  pub fn tag(&self) -> Option<String> {
    self.tag.lock().clone()
  }

  pub fn state(&self) -> OperationState {
    OperationState::from_u8(self.state.load(AtomicOrdering::Acquire))
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Requests cancellation of this operation only.
  ///
  /// If it is registered with a runner, it is deregistered when the executor
  /// reports it finished and no notification is delivered for it.
  pub fn cancel(&self) {
    tracing::trace!(op_id = %self.id, "Operation: Cancellation requested.");
    self.token.cancel();
  }

  /// The token handed to `Work::run`. Cloning it lets other code observe cancellation.
  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.token
  }

  pub(crate) fn set_tag(&self, tag: String) {
    *self.tag.lock() = Some(tag);
  }

  /// Moves the state forward to `next`. Returns false if the operation was
  /// already at or past `next`.
  pub(crate) fn advance(&self, next: OperationState) -> bool {
    let mut current = self.state.load(AtomicOrdering::Acquire);
    loop {
      if current >= next as u8 {
        return false;
      }
      match self
        .state
        .compare_exchange_weak(current, next as u8, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      {
        Ok(_) => return true,
        Err(observed) => current = observed,
      }
    }
  }

  /// Wraps the work into the `'static` future the executor polls.
  pub(crate) fn into_task(self: Arc<Self>) -> TaskToExecute {
    Box::pin(async move {
      self.advance(OperationState::Executing);
      self.work.run(&self.token).await;
    })
  }
}

impl<W: Work> fmt::Debug for Operation<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Operation")
      .field("id", &self.id)
      .field("state", &self.state())
      .field("cancelled", &self.is_cancelled())
      .field("tag", &*self.tag.lock())
      .finish_non_exhaustive()
  }
}

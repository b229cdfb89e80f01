use crate::config::RunnerConfig;
use crate::context::{QueueTarget, ThreadTarget};
use crate::error::RunnerError;
use crate::executor::{BoundedExecutor, ExecOutcome, Priority};
use crate::operation::{Operation, OperationId, OperationState, Work};
use crate::router::{Delivery, DispatchMode, DispatchRouter};

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, trace, warn};

/// Receives finished operations from an `OperationsRunner`.
///
/// Called on the context selected by the runner's `DispatchMode`, once per
/// operation that finished without being cancelled. The submission tag is
/// available through `Operation::tag`.
pub trait RunnerDelegate<W: Work>: Send + Sync + 'static {
  fn operation_finished(&self, operation: Arc<Operation<W>>);
}

impl<W, F> RunnerDelegate<W> for F
where
  W: Work,
  F: Fn(Arc<Operation<W>>) + Send + Sync + 'static,
{
  fn operation_finished(&self, operation: Arc<Operation<W>>) {
    self(operation)
  }
}

thread_local! {
  /// Number of delegate callbacks, of any runner, running on this thread.
  static DELEGATE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn inside_any_delegate() -> bool {
  DELEGATE_DEPTH.with(|depth| depth.get() > 0)
}

/// Everything guarded by the runner's single lock.
struct RunnerState<W: Work> {
  registry: HashMap<OperationId, Arc<Operation<W>>>,
  priority: Priority,
  dispatch: DispatchMode,
  debug_logging: bool,
  /// Bumped by `cancel`; deliveries captured under an older epoch are suppressed.
  epoch: u64,
  /// Threads currently inside a delegate callback.
  delivering: Vec<ThreadId>,
}

struct RunnerShared<W: Work> {
  name: Arc<String>,
  state: Mutex<RunnerState<W>>,
  deliveries_done: Condvar,
  delegate: Box<dyn RunnerDelegate<W>>,
  router: DispatchRouter,
}

/// Runs operations on a bounded executor, tracks the ones in flight and
/// notifies a delegate as each one finishes.
///
/// Registry mutations, configuration changes and delivery bookkeeping all go
/// through one lock, so `count`, `enumerate` and `cancel` observe a
/// linearizable view. Call `cancel` before dropping the delegate's owner:
/// once it returns, the delegate is not called again for any operation
/// submitted before the call.
pub struct OperationsRunner<W: Work> {
  shared: Arc<RunnerShared<W>>,
  executor: Arc<BoundedExecutor>,
}

impl<W: Work> fmt::Debug for OperationsRunner<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("OperationsRunner")
      .field("name", &self.shared.name)
      .field("registered", &state.registry.len())
      .field("priority", &state.priority)
      .field("dispatch", &state.dispatch.label())
      .field("executor", &self.executor)
      .finish()
  }
}

impl<W: Work> OperationsRunner<W> {
  /// Creates a runner with default settings and its own executor.
  pub fn new(delegate: impl RunnerDelegate<W>, tokio_handle: TokioHandle) -> Self {
    Self::with_config(delegate, RunnerConfig::default(), tokio_handle)
  }

  pub fn with_config(delegate: impl RunnerDelegate<W>, config: RunnerConfig, tokio_handle: TokioHandle) -> Self {
    let executor = BoundedExecutor::new(config.max_ops, tokio_handle, &config.name);
    Self::build(delegate, config, executor)
  }

  /// Creates a runner that shares `executor` with other runners. The
  /// executor's concurrency limit is kept; `config.max_ops` is ignored.
  pub fn with_executor(delegate: impl RunnerDelegate<W>, config: RunnerConfig, executor: Arc<BoundedExecutor>) -> Self {
    Self::build(delegate, config, executor)
  }

  fn build(delegate: impl RunnerDelegate<W>, config: RunnerConfig, executor: Arc<BoundedExecutor>) -> Self {
    let RunnerConfig {
      name,
      priority,
      max_ops: _,
      dispatch,
      debug_logging,
      main_context,
    } = config;

    if debug_logging {
      debug!(runner = %name, executor = %executor.name(), mode = dispatch.label(), "Runner created.");
    }

    Self {
      shared: Arc::new(RunnerShared {
        name: Arc::new(name),
        state: Mutex::new(RunnerState {
          registry: HashMap::new(),
          priority,
          dispatch,
          debug_logging,
          epoch: 0,
          delivering: Vec::new(),
        }),
        deliveries_done: Condvar::new(),
        delegate: Box::new(delegate),
        router: DispatchRouter::new(main_context),
      }),
      executor,
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn executor(&self) -> &Arc<BoundedExecutor> {
    &self.executor
  }

  /// Registers `operation` and queues it on the executor.
  ///
  /// Never waits for an execution slot.
  ///
  /// # Errors
  /// `AlreadySubmitted` if the operation is registered right now,
  /// `AlreadyFinished` if it was admitted before (by any runner), and
  /// `ExecutorShutDown` if the executor no longer accepts work.
  pub fn submit(&self, operation: Arc<Operation<W>>, tag: impl Into<String>) -> Result<(), RunnerError> {
    let tag = tag.into();
    let priority = {
      let mut state = self.shared.state.lock();
      self.check_admissible(&state, &operation)?;
      self.register(&mut state, &operation, tag);
      state.priority
    };
    self.hand_off(operation, priority)
  }

  /// Admits every `(operation, tag)` pair, or none of them if any pair
  /// violates the submission contract.
  ///
  /// # Errors
  /// As `submit`, plus `DuplicateInBatch` when the same operation appears twice.
  /// If the executor shuts down while the batch is being handed off, the
  /// operations not yet handed off are deregistered and `ExecutorShutDown`
  /// is returned.
  pub fn submit_all<I, T>(&self, operations: I) -> Result<(), RunnerError>
  where
    I: IntoIterator<Item = (Arc<Operation<W>>, T)>,
    T: Into<String>,
  {
    let batch: Vec<(Arc<Operation<W>>, String)> = operations
      .into_iter()
      .map(|(operation, tag)| (operation, tag.into()))
      .collect();

    let (admitted, priority) = {
      let mut state = self.shared.state.lock();
      let mut seen = HashSet::with_capacity(batch.len());
      for (operation, _) in &batch {
        if !seen.insert(operation.id()) {
          error!(runner = %*self.shared.name, op_id = %operation.id(), "Batch contains the same operation twice.");
          return Err(RunnerError::DuplicateInBatch(operation.id()));
        }
        self.check_admissible(&state, operation)?;
      }

      let mut admitted = Vec::with_capacity(batch.len());
      for (operation, tag) in batch {
        self.register(&mut state, &operation, tag);
        admitted.push(operation);
      }
      (admitted, state.priority)
    };

    let mut remaining = admitted.into_iter();
    while let Some(operation) = remaining.next() {
      if let Err(e) = self.hand_off(operation, priority) {
        for operation in remaining {
          self.shared.rollback(&operation);
        }
        return Err(e);
      }
    }
    Ok(())
  }

  /// Number of registered operations.
  pub fn count(&self) -> usize {
    self.shared.state.lock().registry.len()
  }

  /// Calls `visitor` once per operation registered at the moment of the call.
  ///
  /// The snapshot is taken under the lock; `visitor` runs outside it and may
  /// call back into the runner.
  pub fn enumerate<F>(&self, mut visitor: F)
  where
    F: FnMut(&Arc<Operation<W>>),
  {
    let snapshot: Vec<Arc<Operation<W>>> = self.shared.state.lock().registry.values().cloned().collect();
    for operation in &snapshot {
      visitor(operation);
    }
  }

  /// Cancels every registered operation and suppresses all pending deliveries.
  ///
  /// Blocks until no delegate callback is running on another thread. After
  /// it returns the delegate is not called for any operation submitted before
  /// the call, even if that operation's work is still finishing. Called from
  /// inside a delegate callback of this or any other runner, it suppresses
  /// later deliveries but does not wait for callbacks running on other threads.
  pub fn cancel(&self) {
    let mut state = self.shared.state.lock();
    state.epoch = state.epoch.wrapping_add(1);

    let cancelled = state.registry.len();
    for (_, operation) in state.registry.drain() {
      operation.cancel();
      operation.advance(OperationState::Cancelled);
    }

    // A callback waiting here could deadlock against another callback cancelling its runner.
    let inside_callback = inside_any_delegate();
    while !inside_callback && !state.delivering.is_empty() {
      trace!(runner = %*self.shared.name, "Cancel: Waiting for in-progress delegate callbacks.");
      self.shared.deliveries_done.wait(&mut state);
    }

    if state.debug_logging {
      debug!(runner = %*self.shared.name, cancelled, "Cancelled all registered operations.");
    }
  }

  // --- Configuration ---

  pub fn priority(&self) -> Priority {
    self.shared.state.lock().priority
  }

  /// Applies to operations submitted after the call.
  pub fn set_priority(&self, priority: Priority) {
    self.shared.state.lock().priority = priority;
  }

  pub fn max_ops(&self) -> usize {
    self.executor.max_ops()
  }

  /// Changes the executor's concurrency limit. With a shared executor this
  /// affects every runner using it.
  pub fn set_max_ops(&self, max_ops: usize) {
    let _state = self.shared.state.lock();
    self.executor.set_max_ops(max_ops);
  }

  pub fn dispatch_mode(&self) -> DispatchMode {
    self.shared.state.lock().dispatch.clone()
  }

  /// Applies to operations that finish after the call.
  pub fn set_dispatch_mode(&self, mode: DispatchMode) {
    let mut state = self.shared.state.lock();
    if state.debug_logging {
      debug!(runner = %*self.shared.name, from = state.dispatch.label(), to = mode.label(), "Dispatch mode changed.");
    }
    state.dispatch = mode;
  }

  /// Delivers notifications on `target`; switches the mode to `SpecificThread`.
  pub fn set_delegate_thread(&self, target: ThreadTarget) {
    self.set_dispatch_mode(DispatchMode::SpecificThread(target));
  }

  /// Delivers notifications on `target`; switches the mode to `SpecificQueue`.
  pub fn set_delegate_queue(&self, target: QueueTarget) {
    self.set_dispatch_mode(DispatchMode::SpecificQueue(target));
  }

  pub fn debug_logging(&self) -> bool {
    self.shared.state.lock().debug_logging
  }

  pub fn set_debug_logging(&self, enabled: bool) {
    self.shared.state.lock().debug_logging = enabled;
  }

  // --- Internals ---

  fn check_admissible(&self, state: &RunnerState<W>, operation: &Arc<Operation<W>>) -> Result<(), RunnerError> {
    let op_id = operation.id();
    if state.registry.contains_key(&op_id) {
      error!(runner = %*self.shared.name, %op_id, "Operation submitted while already registered.");
      return Err(RunnerError::AlreadySubmitted(op_id));
    }
    if operation.state() != OperationState::Pending {
      error!(runner = %*self.shared.name, %op_id, state = ?operation.state(), "Operation submitted after it was already admitted.");
      return Err(RunnerError::AlreadyFinished(op_id));
    }
    if self.executor.is_shut_down() {
      warn!(runner = %*self.shared.name, %op_id, "Operation submitted to a runner whose executor is shut down.");
      return Err(RunnerError::ExecutorShutDown);
    }
    Ok(())
  }

  fn register(&self, state: &mut RunnerState<W>, operation: &Arc<Operation<W>>, tag: String) {
    if state.debug_logging {
      debug!(runner = %*self.shared.name, op_id = %operation.id(), tag = %tag, "Registering operation.");
    }
    operation.set_tag(tag);
    operation.advance(OperationState::Submitted);
    state.registry.insert(operation.id(), operation.clone());
  }

  fn hand_off(&self, operation: Arc<Operation<W>>, priority: Priority) -> Result<(), RunnerError> {
    let shared = self.shared.clone();
    let completed = operation.clone();
    let accepted = self.executor.accept(
      operation.id(),
      priority,
      operation.cancellation_token().clone(),
      operation.clone().into_task(),
      Box::new(move |outcome| shared.finish(completed, outcome)),
    );
    if let Err(e) = accepted {
      self.shared.rollback(&operation);
      return Err(e);
    }
    Ok(())
  }
}

impl<W: Work> RunnerShared<W> {
  /// Completion bookkeeping, called once per accepted operation from the executor.
  fn finish(self: &Arc<Self>, operation: Arc<Operation<W>>, outcome: ExecOutcome) {
    let op_id = operation.id();
    let pending_delivery = {
      let mut state = self.state.lock();
      let was_registered = state.registry.remove(&op_id).is_some();
      let cancelled = operation.is_cancelled() || matches!(outcome, ExecOutcome::Cancelled | ExecOutcome::Discarded);

      operation.advance(if cancelled {
        OperationState::Cancelled
      } else {
        OperationState::Completed
      });
      operation.advance(OperationState::Deregistered);

      if state.debug_logging {
        debug!(runner = %*self.name, %op_id, ?outcome, was_registered, "Operation finished and deregistered.");
      }

      if was_registered && !cancelled {
        Some((state.dispatch.clone(), state.epoch))
      } else {
        None
      }
    };

    let Some((mode, epoch)) = pending_delivery else {
      trace!(runner = %*self.name, %op_id, "No notification for cancelled operation.");
      return;
    };

    let shared = self.clone();
    let delivery = self.router.deliver(
      &mode,
      Box::new(move || shared.notify_delegate(operation, epoch)),
    );
    if delivery == Delivery::Dropped {
      debug!(runner = %*self.name, %op_id, mode = mode.label(), "Dispatch target is gone; notification dropped.");
    }
  }

  /// Runs on the target context. Re-checks the cancellation epoch under the
  /// lock so that nothing reaches the delegate once `cancel` has returned.
  fn notify_delegate(self: &Arc<Self>, operation: Arc<Operation<W>>, epoch: u64) {
    {
      let mut state = self.state.lock();
      if state.epoch != epoch || operation.is_cancelled() {
        trace!(runner = %*self.name, op_id = %operation.id(), "Notification suppressed by cancellation.");
        return;
      }
      state.delivering.push(thread::current().id());
    }

    DELEGATE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _in_progress = DeliveryGuard { shared: &**self };
    let op_id = operation.id();
    if catch_unwind(AssertUnwindSafe(|| self.delegate.operation_finished(operation))).is_err() {
      error!(runner = %*self.name, %op_id, "Delegate panicked while handling a finished operation.");
    }
  }

  fn rollback(&self, operation: &Arc<Operation<W>>) {
    let mut state = self.state.lock();
    state.registry.remove(&operation.id());
    operation.advance(OperationState::Cancelled);
    operation.advance(OperationState::Deregistered);
  }
}

/// Marks the end of a delegate callback and wakes a waiting `cancel`.
struct DeliveryGuard<'a, W: Work> {
  shared: &'a RunnerShared<W>,
}

impl<W: Work> Drop for DeliveryGuard<'_, W> {
  fn drop(&mut self) {
    DELEGATE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    let current_thread = thread::current().id();
    let mut state = self.shared.state.lock();
    if let Some(index) = state.delivering.iter().position(|thread_id| *thread_id == current_thread) {
      state.delivering.swap_remove(index);
    }
    self.shared.deliveries_done.notify_all();
  }
}

impl<W: Work> Drop for OperationsRunner<W> {
  fn drop(&mut self) {
    let registered = self.count();
    if registered > 0 {
      warn!(
        runner = %*self.shared.name,
        registered,
        "OperationsRunner dropped with operations still registered; call cancel() first to stop further notifications."
      );
    } else {
      info!(runner = %*self.shared.name, "OperationsRunner dropped.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::MainContext;
  use crate::operation::WorkFuture;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  struct SleepWork {
    millis: u64,
  }

  impl Work for SleepWork {
    fn run<'a>(&'a self, _cancel: &'a CancellationToken) -> WorkFuture<'a> {
      Box::pin(tokio::time::sleep(Duration::from_millis(self.millis)))
    }
  }

  fn sleeper(millis: u64) -> Arc<Operation<SleepWork>> {
    Operation::new(SleepWork { millis })
  }

  fn counting_runner(counter: Arc<AtomicUsize>) -> OperationsRunner<SleepWork> {
    let config = RunnerConfig::default()
      .with_name("runner_unit")
      .with_max_ops(2)
      .with_dispatch(DispatchMode::AnyContext)
      .with_main_context(MainContext::new());
    OperationsRunner::with_config(
      move |_op: Arc<Operation<SleepWork>>| {
        counter.fetch_add(1, Ordering::SeqCst);
      },
      config,
      TokioHandle::current(),
    )
  }

  #[tokio::test]
  async fn test_submit_registers_and_tags() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = counting_runner(counter.clone());
    let op = sleeper(50);
    runner.submit(op.clone(), "fetch index").unwrap();
    assert_eq!(runner.count(), 1);
    assert_eq!(op.tag().as_deref(), Some("fetch index"));
    assert!(op.state() >= OperationState::Submitted);

    let mut seen = Vec::new();
    runner.enumerate(|registered| seen.push(registered.id()));
    assert_eq!(seen, vec![op.id()]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runner.count(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(op.state(), OperationState::Deregistered);
  }

  #[tokio::test]
  async fn test_double_submit_is_rejected() {
    let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
    let op = sleeper(200);
    runner.submit(op.clone(), "first").unwrap();
    assert_eq!(runner.submit(op.clone(), "second"), Err(RunnerError::AlreadySubmitted(op.id())));
    assert_eq!(runner.count(), 1);
    assert_eq!(op.tag().as_deref(), Some("first"));
    runner.cancel();
  }

  #[tokio::test]
  async fn test_finished_operation_cannot_be_readmitted() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = counting_runner(counter.clone());
    let op = sleeper(10);
    runner.submit(op.clone(), "once").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.submit(op.clone(), "twice"), Err(RunnerError::AlreadyFinished(op.id())));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_batch_with_duplicate_admits_nothing() {
    let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
    let a = sleeper(10);
    let b = sleeper(10);
    let result = runner.submit_all(vec![(a.clone(), "a"), (b.clone(), "b"), (a.clone(), "a again")]);
    assert_eq!(result, Err(RunnerError::DuplicateInBatch(a.id())));
    assert_eq!(runner.count(), 0);
    assert_eq!(a.state(), OperationState::Pending);
    assert_eq!(b.state(), OperationState::Pending);
  }

  #[tokio::test]
  async fn test_cancelling_single_operation_suppresses_its_notification() {
    let counter = Arc::new(AtomicUsize::new(0));
    let runner = counting_runner(counter.clone());
    let cancelled = sleeper(300);
    let kept = sleeper(20);
    runner.submit(cancelled.clone(), "cancelled").unwrap();
    runner.submit(kept.clone(), "kept").unwrap();
    cancelled.cancel();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runner.count(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cancelled.state(), OperationState::Deregistered);
  }

  #[tokio::test]
  async fn test_shut_down_executor_rejects_submission() {
    let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
    runner.executor().shutdown_and_wait().await;
    let op = sleeper(10);
    assert_eq!(runner.submit(op.clone(), "late"), Err(RunnerError::ExecutorShutDown));
    assert_eq!(runner.count(), 0);
    assert_eq!(op.state(), OperationState::Pending);
  }

  #[tokio::test]
  async fn test_setters_last_call_wins() {
    let runner = counting_runner(Arc::new(AtomicUsize::new(0)));
    runner.set_priority(Priority::High);
    runner.set_max_ops(5);
    runner.set_debug_logging(false);
    runner.set_dispatch_mode(DispatchMode::MainContext);
    let dispatch_thread = crate::context::DispatchThread::spawn("runner-unit-thread").unwrap();
    runner.set_delegate_thread(dispatch_thread.target());
    assert_eq!(runner.priority(), Priority::High);
    assert_eq!(runner.max_ops(), 5);
    assert!(!runner.debug_logging());
    assert!(matches!(runner.dispatch_mode(), DispatchMode::SpecificThread(_)));
    runner.set_dispatch_mode(DispatchMode::AnyContext);
    assert!(matches!(runner.dispatch_mode(), DispatchMode::AnyContext));
  }
}

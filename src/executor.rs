use crate::error::RunnerError;
use crate::job_queue::{CompletionFn, Job, JobQueue};
use crate::operation::OperationId;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// The type of future the executor polls.
pub type TaskToExecute = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Scheduling hint. Among queued operations, higher priority is started first;
/// equal priorities start in submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
}

/// How the executor finished with an accepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
  /// The work future ran to its end.
  Finished,
  /// The operation's token was cancelled before or while it ran.
  Cancelled,
  /// The work future panicked.
  Panicked,
  /// The executor shut down before the operation got a slot.
  Discarded,
}

/// Runs at most `max_ops` operations at once on a Tokio runtime.
///
/// A single worker loop acquires a semaphore permit, then dequeues the
/// highest-priority job and spawns it holding that permit. Several runners may
/// share one executor.
pub struct BoundedExecutor {
  name: Arc<String>,
  semaphore: Arc<Semaphore>,
  limit: Mutex<usize>,
  /// Permits still owed to a lowered limit, retired as running operations end.
  retire_debt: Arc<AtomicUsize>,
  queue: Arc<JobQueue>,
  executing: Arc<AtomicUsize>,
  next_seq: AtomicU64,
  shutdown_token: CancellationToken,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BoundedExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedExecutor")
      .field("name", &self.name)
      .field("max_ops", &*self.limit.lock())
      .field("executing", &self.executing_count())
      .field("queued", &self.queued_count())
      .field("shut_down", &self.is_shut_down())
      .finish()
  }
}

impl BoundedExecutor {
  pub fn new(max_ops: usize, tokio_handle: TokioHandle, name: &str) -> Arc<Self> {
    let max_ops = max_ops.max(1);
    let executor = Arc::new(Self {
      name: Arc::new(name.to_string()),
      semaphore: Arc::new(Semaphore::new(max_ops)),
      limit: Mutex::new(max_ops),
      retire_debt: Arc::new(AtomicUsize::new(0)),
      queue: Arc::new(JobQueue::new()),
      executing: Arc::new(AtomicUsize::new(0)),
      next_seq: AtomicU64::new(0),
      shutdown_token: CancellationToken::new(),
      worker_join_handle: Mutex::new(None),
    });

    let worker_loop = Self::run_worker_loop(
      executor.name.clone(),
      executor.semaphore.clone(),
      executor.retire_debt.clone(),
      executor.queue.clone(),
      executor.executing.clone(),
      tokio_handle.clone(),
      executor.shutdown_token.clone(),
    )
    .instrument(info_span!("bounded_executor_worker_loop", name = %name));

    *executor.worker_join_handle.lock() = Some(tokio_handle.spawn(worker_loop));
    executor
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn max_ops(&self) -> usize {
    *self.limit.lock()
  }

  /// Number of operations whose futures are currently being polled.
  pub fn executing_count(&self) -> usize {
    self.executing.load(AtomicOrdering::SeqCst)
  }

  /// Number of accepted operations still waiting for a slot.
  pub fn queued_count(&self) -> usize {
    self.queue.len()
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Changes the concurrency ceiling. Raising it takes effect immediately;
  /// lowering it retires idle permits now and the rest as running operations
  /// give theirs back, so no new operation starts until the count fits.
  pub fn set_max_ops(&self, max_ops: usize) {
    let max_ops = max_ops.max(1);
    let mut limit = self.limit.lock();
    if max_ops > *limit {
      let increase = max_ops - *limit;
      let paid = take_debt(&self.retire_debt, increase);
      if increase > paid {
        self.semaphore.add_permits(increase - paid);
      }
      trace!(name = %*self.name, paid, "Executor: raise offset outstanding retirements.");
    } else if max_ops < *limit {
      self.retire_debt.fetch_add(*limit - max_ops, AtomicOrdering::SeqCst);
      while self.retire_debt.load(AtomicOrdering::SeqCst) > 0 {
        let Ok(idle) = self.semaphore.try_acquire() else {
          break;
        };
        if take_debt(&self.retire_debt, 1) == 1 {
          idle.forget();
        } else {
          break;
        }
      }
      trace!(
        name = %*self.name,
        owed = self.retire_debt.load(AtomicOrdering::SeqCst),
        "Executor: permits left to retire from running operations."
      );
    }
    debug!(name = %*self.name, from = *limit, to = max_ops, "Executor: concurrency limit changed.");
    *limit = max_ops;
  }

  /// Queues a job. `on_complete` is called exactly once with the outcome,
  /// unless this returns an error, in which case it is never called.
  pub(crate) fn accept(
    &self,
    op_id: OperationId,
    priority: Priority,
    token: CancellationToken,
    future: TaskToExecute,
    on_complete: CompletionFn,
  ) -> Result<(), RunnerError> {
    if self.is_shut_down() {
      warn!(name = %*self.name, %op_id, "Executor: Rejecting operation, executor is shut down.");
      return Err(RunnerError::ExecutorShutDown);
    }

    let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
    trace!(name = %*self.name, %op_id, ?priority, seq, "Executor: Queueing operation.");
    self.queue.push(Job {
      op_id,
      priority,
      seq,
      token,
      future,
      on_complete,
    });

    // The worker loop may have drained the queue between the check above and the push.
    if self.is_shut_down() {
      Self::discard_queued(&self.name, &self.queue);
    }
    Ok(())
  }

  /// Stops the worker loop. Running operations continue; queued ones are
  /// completed with `ExecOutcome::Discarded`.
  pub fn shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      info!(name = %*self.name, "Executor: Shutdown requested.");
      self.shutdown_token.cancel();
    }
  }

  /// Like `shutdown`, then waits for the worker loop to exit.
  pub async fn shutdown_and_wait(&self) {
    self.shutdown();
    let handle_to_await = self.worker_join_handle.lock().take();
    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(name = %*self.name, "Executor: Error joining worker loop: {:?}", join_error);
      }
    }
  }

  fn discard_queued(name: &str, queue: &JobQueue) {
    for job in queue.drain() {
      debug!(name = %name, op_id = %job.op_id, "Executor: Discarding queued operation on shutdown.");
      job.complete(ExecOutcome::Discarded);
    }
  }

  async fn run_worker_loop(
    name: Arc<String>,
    semaphore: Arc<Semaphore>,
    retire_debt: Arc<AtomicUsize>,
    queue: Arc<JobQueue>,
    executing: Arc<AtomicUsize>,
    tokio_handle: TokioHandle,
    shutdown_token: CancellationToken,
  ) {
    info!(name = %*name, "Worker loop started.");

    loop {
      let permit = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => break,
        acquired = semaphore.clone().acquire_owned() => match acquired {
          Ok(permit) => permit,
          Err(_) => {
            error!(name = %*name, "Semaphore closed. Worker loop exiting.");
            break;
          }
        },
      };
      trace!(name = %*name, "Acquired slot permit. Available: {}", semaphore.available_permits());

      let job = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => {
          release_slot(permit, &retire_debt);
          break;
        }
        job = queue.pop() => job,
      };

      if job.token.is_cancelled() {
        debug!(name = %*name, op_id = %job.op_id, "Dequeued operation already cancelled.");
        release_slot(permit, &retire_debt);
        job.complete(ExecOutcome::Cancelled);
        continue;
      }

      let Job {
        op_id,
        token,
        future,
        on_complete,
        ..
      } = job;

      executing.fetch_add(1, AtomicOrdering::SeqCst);
      let executing_for_task = executing.clone();
      let name_for_task = name.clone();
      let debt_for_task = retire_debt.clone();

      tokio_handle.spawn(
        async move {
          let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
              debug!(name = %*name_for_task, %op_id, "Operation execution cancelled by its token.");
              ExecOutcome::Cancelled
            }
            result = AssertUnwindSafe(future).catch_unwind() => match result {
              Ok(()) => ExecOutcome::Finished,
              Err(_panic_payload) => {
                error!(name = %*name_for_task, %op_id, "Operation panicked during execution.");
                ExecOutcome::Panicked
              }
            },
          };

          // Leave the executing set before the slot is handed to the next job.
          executing_for_task.fetch_sub(1, AtomicOrdering::SeqCst);
          release_slot(permit, &debt_for_task);
          on_complete(outcome);
        }
        .instrument(info_span!("operation", executor = %*name, %op_id)),
      );
    }

    Self::discard_queued(&name, &queue);
    info!(
      name = %*name,
      "Worker loop stopped. Operations still executing: {}",
      executing.load(AtomicOrdering::SeqCst)
    );
  }
}

/// Takes up to `want` from the outstanding retirement count, returning how much was taken.
fn take_debt(debt: &AtomicUsize, want: usize) -> usize {
  match debt.fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |owed| {
    (owed > 0).then(|| owed - owed.min(want))
  }) {
    Ok(owed) => owed.min(want),
    Err(_) => 0,
  }
}

/// Gives a slot back to the semaphore, or retires it while a lowered limit is still owed permits.
fn release_slot(permit: OwnedSemaphorePermit, debt: &AtomicUsize) {
  if take_debt(debt, 1) == 1 {
    permit.forget();
  } else {
    drop(permit);
  }
}

impl Drop for BoundedExecutor {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      debug!(name = %*self.name, "BoundedExecutor dropped. Signalling worker loop to stop.");
      self.shutdown_token.cancel();
    }
  }
}

//! Execution contexts that completion notifications can be delivered on.
//!
//! - `MainContext`: the application's primary context. Jobs posted to it run
//!   only when the owning thread pumps it (`run_pending`, `run_until`).
//! - `DispatchThread`: a dedicated OS thread draining a mailbox.
//! - `DispatchQueue`: a serial queue on a Tokio runtime.
//!
//! Runners never own a thread or queue; they hold a `ThreadTarget` or
//! `QueueTarget`, a weak handle that stops accepting jobs once the owning
//! `DispatchThread` or `DispatchQueue` is dropped.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc::{self, UnboundedSender, WeakUnboundedSender};
use tracing::{debug, error, trace};

/// A callback waiting to run on some execution context.
pub type DeliveryJob = Box<dyn FnOnce() + Send + 'static>;

lazy_static::lazy_static! {
  static ref NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
  static ref GLOBAL_MAIN_CONTEXT: MainContext = MainContext::new();
}

thread_local! {
  static CURRENT_CONTEXT: Cell<u64> = const { Cell::new(0) };
}

fn next_context_id() -> u64 {
  NEXT_CONTEXT_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Runs `job` with `context_id` marked as current. A panicking job is logged
/// and swallowed so the context keeps serving.
fn run_job(context_id: u64, context_name: &str, job: DeliveryJob) {
  let previous = CURRENT_CONTEXT.with(|current| current.replace(context_id));
  if catch_unwind(AssertUnwindSafe(job)).is_err() {
    error!(context = %context_name, "A delivered callback panicked.");
  }
  CURRENT_CONTEXT.with(|current| current.set(previous));
}

fn is_current_context(context_id: u64) -> bool {
  CURRENT_CONTEXT.with(|current| current.get() == context_id)
}

// --- Main context ---

struct MainContextInner {
  id: u64,
  jobs: Mutex<VecDeque<DeliveryJob>>,
  ready: Condvar,
}

/// The application's primary execution context.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct MainContext {
  inner: Arc<MainContextInner>,
}

impl fmt::Debug for MainContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MainContext")
      .field("id", &self.inner.id)
      .field("pending", &self.pending())
      .finish()
  }
}

impl Default for MainContext {
  fn default() -> Self {
    Self::new()
  }
}

impl MainContext {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(MainContextInner {
        id: next_context_id(),
        jobs: Mutex::new(VecDeque::new()),
        ready: Condvar::new(),
      }),
    }
  }

  /// The process-wide main context used by runners that are not given one.
  pub fn global() -> MainContext {
    GLOBAL_MAIN_CONTEXT.clone()
  }

  /// True while called from a job this context is running.
  pub fn is_current(&self) -> bool {
    is_current_context(self.inner.id)
  }

  /// Number of jobs waiting to be pumped.
  pub fn pending(&self) -> usize {
    self.inner.jobs.lock().len()
  }

  pub(crate) fn post(&self, job: DeliveryJob) {
    self.inner.jobs.lock().push_back(job);
    self.inner.ready.notify_all();
  }

  fn pop(&self) -> Option<DeliveryJob> {
    self.inner.jobs.lock().pop_front()
  }

  /// Runs every job queued at call time, plus any they post. Returns how many ran.
  pub fn run_pending(&self) -> usize {
    let mut ran = 0;
    while let Some(job) = self.pop() {
      run_job(self.inner.id, "main", job);
      ran += 1;
    }
    ran
  }

  /// Pumps jobs until `done` returns true or `timeout` elapses, blocking while
  /// idle. Returns the final value of `done`.
  pub fn run_until<F: FnMut() -> bool>(&self, timeout: Duration, mut done: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      self.run_pending();
      if done() {
        return true;
      }
      let mut jobs = self.inner.jobs.lock();
      if jobs.is_empty() {
        if Instant::now() >= deadline {
          drop(jobs);
          return done();
        }
        self.inner.ready.wait_until(&mut jobs, deadline);
      }
    }
  }
}

// --- Dedicated thread ---

/// An OS thread that runs delivered callbacks one at a time.
///
/// Dropping it closes the mailbox and joins the thread after it finishes the
/// jobs already posted. Targets handed out earlier then drop new deliveries.
pub struct DispatchThread {
  id: u64,
  name: Arc<String>,
  tx: Option<UnboundedSender<DeliveryJob>>,
  thread_id: ThreadId,
  join_handle: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for DispatchThread {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DispatchThread")
      .field("name", &self.name)
      .field("thread_id", &self.thread_id)
      .finish_non_exhaustive()
  }
}

impl DispatchThread {
  pub fn spawn(name: &str) -> io::Result<Self> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryJob>();
    let id = next_context_id();
    let thread_name = Arc::new(name.to_string());
    let loop_name = thread_name.clone();

    let join_handle = thread::Builder::new().name(name.to_string()).spawn(move || {
      debug!(context = %*loop_name, "Dispatch thread started.");
      while let Some(job) = rx.blocking_recv() {
        run_job(id, &loop_name, job);
      }
      debug!(context = %*loop_name, "Dispatch thread mailbox closed. Exiting.");
    })?;

    Ok(Self {
      id,
      name: thread_name,
      thread_id: join_handle.thread().id(),
      tx: Some(tx),
      join_handle: Some(join_handle),
    })
  }

  pub fn thread_id(&self) -> ThreadId {
    self.thread_id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// A non-owning handle runners use to post to this thread.
  pub fn target(&self) -> ThreadTarget {
    ThreadTarget {
      id: self.id,
      name: self.name.clone(),
      thread_id: self.thread_id,
      tx: self.tx.as_ref().map(UnboundedSender::downgrade),
    }
  }
}

impl Drop for DispatchThread {
  fn drop(&mut self) {
    drop(self.tx.take());
    if let Some(handle) = self.join_handle.take() {
      if thread::current().id() == self.thread_id {
        // Dropped from one of its own callbacks; the loop exits on its own.
        return;
      }
      if handle.join().is_err() {
        error!(context = %*self.name, "Dispatch thread terminated abnormally.");
      }
    }
  }
}

/// Weak handle to a `DispatchThread`.
#[derive(Clone)]
pub struct ThreadTarget {
  id: u64,
  name: Arc<String>,
  thread_id: ThreadId,
  tx: Option<WeakUnboundedSender<DeliveryJob>>,
}

impl fmt::Debug for ThreadTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThreadTarget")
      .field("name", &self.name)
      .field("thread_id", &self.thread_id)
      .field("alive", &self.is_alive())
      .finish()
  }
}

impl ThreadTarget {
  pub fn thread_id(&self) -> ThreadId {
    self.thread_id
  }

  /// False once the owning `DispatchThread` has been dropped.
  pub fn is_alive(&self) -> bool {
    self
      .tx
      .as_ref()
      .and_then(WeakUnboundedSender::upgrade)
      .is_some_and(|tx| !tx.is_closed())
  }

  pub fn is_current(&self) -> bool {
    is_current_context(self.id)
  }

  /// Posts `job`; returns false (and drops it) if the thread is gone.
  pub(crate) fn post(&self, job: DeliveryJob) -> bool {
    post_weak(&self.tx, &self.name, job)
  }
}

// --- Serial queue ---

/// A serial queue on a Tokio runtime. Jobs run one at a time, in order, on
/// the runtime's blocking pool.
pub struct DispatchQueue {
  id: u64,
  name: Arc<String>,
  tx: Option<UnboundedSender<DeliveryJob>>,
}

impl fmt::Debug for DispatchQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DispatchQueue").field("name", &self.name).finish_non_exhaustive()
  }
}

impl DispatchQueue {
  pub fn new(tokio_handle: &TokioHandle, name: &str) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryJob>();
    let id = next_context_id();
    let queue_name = Arc::new(name.to_string());
    let loop_name = queue_name.clone();
    let blocking_handle = tokio_handle.clone();

    tokio_handle.spawn(async move {
      while let Some(job) = rx.recv().await {
        let job_name = loop_name.clone();
        let joined = blocking_handle
          .spawn_blocking(move || run_job(id, &job_name, job))
          .await;
        if let Err(join_error) = joined {
          error!(context = %*loop_name, "Dispatch queue job failed to join: {:?}", join_error);
        }
      }
      debug!(context = %*loop_name, "Dispatch queue closed.");
    });

    Self {
      id,
      name: queue_name,
      tx: Some(tx),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_current(&self) -> bool {
    is_current_context(self.id)
  }

  pub fn target(&self) -> QueueTarget {
    QueueTarget {
      id: self.id,
      name: self.name.clone(),
      tx: self.tx.as_ref().map(UnboundedSender::downgrade),
    }
  }
}

impl Drop for DispatchQueue {
  fn drop(&mut self) {
    trace!(context = %*self.name, "Dispatch queue handle dropped.");
    drop(self.tx.take());
  }
}

/// Weak handle to a `DispatchQueue`.
#[derive(Clone)]
pub struct QueueTarget {
  id: u64,
  name: Arc<String>,
  tx: Option<WeakUnboundedSender<DeliveryJob>>,
}

impl fmt::Debug for QueueTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueTarget")
      .field("name", &self.name)
      .field("alive", &self.is_alive())
      .finish()
  }
}

impl QueueTarget {
  pub fn is_alive(&self) -> bool {
    self
      .tx
      .as_ref()
      .and_then(WeakUnboundedSender::upgrade)
      .is_some_and(|tx| !tx.is_closed())
  }

  pub fn is_current(&self) -> bool {
    is_current_context(self.id)
  }

  pub(crate) fn post(&self, job: DeliveryJob) -> bool {
    post_weak(&self.tx, &self.name, job)
  }
}

fn post_weak(tx: &Option<WeakUnboundedSender<DeliveryJob>>, name: &str, job: DeliveryJob) -> bool {
  match tx.as_ref().and_then(WeakUnboundedSender::upgrade) {
    Some(tx) => {
      if tx.send(job).is_ok() {
        true
      } else {
        trace!(context = %name, "Target mailbox closed; dropping delivery.");
        false
      }
    }
    None => {
      trace!(context = %name, "Target no longer exists; dropping delivery.");
      false
    }
  }
}

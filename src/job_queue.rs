use crate::executor::{ExecOutcome, Priority, TaskToExecute};
use crate::operation::OperationId;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Completion callback attached to a job. Called exactly once.
pub(crate) type CompletionFn = Box<dyn FnOnce(ExecOutcome) + Send + 'static>;

/// A unit accepted by the executor and waiting for a slot.
pub(crate) struct Job {
  pub(crate) op_id: OperationId,
  pub(crate) priority: Priority,
  pub(crate) seq: u64,
  pub(crate) token: CancellationToken,
  pub(crate) future: TaskToExecute,
  pub(crate) on_complete: CompletionFn,
}

impl Job {
  pub(crate) fn complete(self, outcome: ExecOutcome) {
    (self.on_complete)(outcome);
  }
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("op_id", &self.op_id)
      .field("priority", &self.priority)
      .field("seq", &self.seq)
      .finish_non_exhaustive()
  }
}

// Higher priority first, then lower sequence number (FIFO within a priority).
impl Ord for Job {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for Job {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Job {
  fn eq(&self, other: &Self) -> bool {
    self.seq == other.seq
  }
}

impl Eq for Job {}

/// Unbounded priority queue with an async, single-consumer `pop`.
///
/// `push` never blocks beyond the heap lock, so admission stays non-blocking
/// while the worker loop waits for work.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
  heap: Mutex<BinaryHeap<Job>>,
  available: Notify,
}

impl JobQueue {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn push(&self, job: Job) {
    self.heap.lock().push(job);
    self.available.notify_one();
  }

  /// Waits until a job is available and removes the highest-ranked one.
  pub(crate) async fn pop(&self) -> Job {
    loop {
      if let Some(job) = self.heap.lock().pop() {
        return job;
      }
      self.available.notified().await;
    }
  }

  /// Removes every queued job, highest-ranked first.
  pub(crate) fn drain(&self) -> Vec<Job> {
    let mut heap = self.heap.lock();
    let mut drained = Vec::with_capacity(heap.len());
    while let Some(job) = heap.pop() {
      drained.push(job);
    }
    drained
  }

  pub(crate) fn len(&self) -> usize {
    self.heap.lock().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
  use std::sync::Arc;
  use std::time::Duration;

  fn dummy_job(seq: u64, priority: Priority) -> Job {
    Job {
      op_id: crate::operation::from_fn(|_| async {}).id(),
      priority,
      seq,
      token: CancellationToken::new(),
      future: Box::pin(async {}),
      on_complete: Box::new(|_| {}),
    }
  }

  #[tokio::test]
  async fn test_pop_orders_by_priority_then_fifo() {
    let queue = JobQueue::new();
    queue.push(dummy_job(1, Priority::Normal));
    queue.push(dummy_job(2, Priority::Low));
    queue.push(dummy_job(3, Priority::High));
    queue.push(dummy_job(4, Priority::Normal));
    assert_eq!(queue.len(), 4);

    let order: Vec<u64> = vec![
      queue.pop().await.seq,
      queue.pop().await.seq,
      queue.pop().await.seq,
      queue.pop().await.seq,
    ];
    assert_eq!(order, vec![3, 1, 4, 2]);
    assert_eq!(queue.len(), 0);
  }

  #[tokio::test]
  async fn test_pop_waits_for_push() {
    let queue = Arc::new(JobQueue::new());
    let pop_future = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.pop().await.seq })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pop_future.is_finished(), "pop should wait on an empty queue");

    queue.push(dummy_job(7, Priority::Normal));
    let seq = tokio::time::timeout(Duration::from_millis(500), pop_future)
      .await
      .expect("pop did not wake after push")
      .unwrap();
    assert_eq!(seq, 7);
  }

  #[test]
  fn test_drain_runs_nothing_and_empties_queue() {
    let queue = JobQueue::new();
    let completions = Arc::new(AtomicUsize::new(0));
    for seq in 0..3 {
      let mut job = dummy_job(seq, Priority::Normal);
      let completions = completions.clone();
      job.on_complete = Box::new(move |outcome| {
        assert_eq!(outcome, ExecOutcome::Discarded);
        completions.fetch_add(1, AtomicOrdering::SeqCst);
      });
      queue.push(job);
    }
    for job in queue.drain() {
      job.complete(ExecOutcome::Discarded);
    }
    assert_eq!(queue.len(), 0);
    assert_eq!(completions.load(AtomicOrdering::SeqCst), 3);
  }
}

use crate::context::{DeliveryJob, MainContext, QueueTarget, ThreadTarget};

use tracing::trace;

/// Where completion notifications are delivered.
///
/// The variant is the single source of truth, so a thread or queue target
/// cannot be active at the same time as another mode.
#[derive(Debug, Clone, Default)]
pub enum DispatchMode {
  /// The runner's `MainContext`; runs when the owner pumps it.
  #[default]
  MainContext,
  /// Directly on whichever executor worker finished the operation.
  AnyContext,
  /// A dedicated thread. Dropped if the thread is gone at delivery time.
  SpecificThread(ThreadTarget),
  /// A serial queue. Dropped if the queue is gone at delivery time.
  SpecificQueue(QueueTarget),
}

impl DispatchMode {
  pub fn label(&self) -> &'static str {
    match self {
      DispatchMode::MainContext => "main_context",
      DispatchMode::AnyContext => "any_context",
      DispatchMode::SpecificThread(_) => "specific_thread",
      DispatchMode::SpecificQueue(_) => "specific_queue",
    }
  }
}

/// What happened to a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  /// Ran on the calling context before `deliver` returned.
  Inline,
  /// Handed to the target context's mailbox.
  Posted,
  /// The target no longer exists; the job was dropped unrun.
  Dropped,
}

/// Sends one job to exactly one execution context.
#[derive(Debug, Clone)]
pub struct DispatchRouter {
  main_context: MainContext,
}

impl DispatchRouter {
  pub fn new(main_context: MainContext) -> Self {
    Self { main_context }
  }

  /// Delivers `job` according to `mode`. Only the inline mode runs the job
  /// before returning; the others only enqueue it.
  pub fn deliver(&self, mode: &DispatchMode, job: DeliveryJob) -> Delivery {
    let delivery = match mode {
      DispatchMode::MainContext => {
        self.main_context.post(job);
        Delivery::Posted
      }
      DispatchMode::AnyContext => {
        job();
        Delivery::Inline
      }
      DispatchMode::SpecificThread(target) => {
        if target.post(job) {
          Delivery::Posted
        } else {
          Delivery::Dropped
        }
      }
      DispatchMode::SpecificQueue(target) => {
        if target.post(job) {
          Delivery::Posted
        } else {
          Delivery::Dropped
        }
      }
    };
    trace!(mode = mode.label(), ?delivery, "Router: delivery attempted.");
    delivery
  }
}

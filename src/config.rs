use crate::context::MainContext;
use crate::executor::Priority;
use crate::router::DispatchMode;

use std::num::NonZeroUsize;
use std::thread;

const DEFAULT_RUNNER_NAME: &str = "operations-runner";
const FALLBACK_MAX_OPS: usize = 4;

/// Settings for an `OperationsRunner`.
///
/// The runner copies these into its locked state at construction; the
/// runner's setters change them afterwards, and the last call wins.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
  /// Used in log fields and as the executor's name.
  pub name: String,
  /// Ordering hint for queued operations.
  pub priority: Priority,
  /// Concurrency ceiling of the executor the runner creates.
  pub max_ops: usize,
  /// Where completion notifications go.
  pub dispatch: DispatchMode,
  /// Emit per-operation lifecycle messages at `debug` level.
  pub debug_logging: bool,
  /// The context `DispatchMode::MainContext` delivers to.
  pub main_context: MainContext,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_RUNNER_NAME.to_string(),
      priority: Priority::default(),
      max_ops: thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(FALLBACK_MAX_OPS),
      dispatch: DispatchMode::default(),
      debug_logging: true,
      main_context: MainContext::global(),
    }
  }
}

impl RunnerConfig {
  pub fn with_name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  /// Values below 1 are raised to 1.
  pub fn with_max_ops(mut self, max_ops: usize) -> Self {
    self.max_ops = max_ops.max(1);
    self
  }

  pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
    self.dispatch = dispatch;
    self
  }

  pub fn with_debug_logging(mut self, enabled: bool) -> Self {
    self.debug_logging = enabled;
    self
  }

  pub fn with_main_context(mut self, main_context: MainContext) -> Self {
    self.main_context = main_context;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = RunnerConfig::default();
    assert_eq!(config.name, DEFAULT_RUNNER_NAME);
    assert_eq!(config.priority, Priority::Normal);
    assert!(config.max_ops >= 1);
    assert!(matches!(config.dispatch, DispatchMode::MainContext));
    assert!(config.debug_logging);
  }

  #[test]
  fn test_builder_last_call_wins() {
    let config = RunnerConfig::default()
      .with_dispatch(DispatchMode::AnyContext)
      .with_dispatch(DispatchMode::MainContext)
      .with_max_ops(0)
      .with_priority(Priority::High)
      .with_debug_logging(false);
    assert!(matches!(config.dispatch, DispatchMode::MainContext));
    assert_eq!(config.max_ops, 1);
    assert_eq!(config.priority, Priority::High);
    assert!(!config.debug_logging);
  }
}

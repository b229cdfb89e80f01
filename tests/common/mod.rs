#![allow(dead_code)]

use operations_runner::{Operation, Work, WorkFuture};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// Helper to initialize tracing for tests (call once per test run, not per test function)
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,operations_runner=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Tracks how many operations are running at once and the order they started in.
#[derive(Debug, Default)]
pub struct Gauge {
  running: AtomicUsize,
  peak: AtomicUsize,
  started: Mutex<Vec<String>>,
}

pub struct RunningGuard<'a> {
  gauge: &'a Gauge,
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.gauge.running.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Gauge {
  pub fn enter(&self, label: &str) -> RunningGuard<'_> {
    let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now_running, Ordering::SeqCst);
    self.started.lock().unwrap().push(label.to_string());
    RunningGuard { gauge: self }
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn running(&self) -> usize {
    self.running.load(Ordering::SeqCst)
  }

  pub fn started(&self) -> Vec<String> {
    self.started.lock().unwrap().clone()
  }
}

/// A stand-in for a network fetch: sleeps, checks its token every 10ms, then
/// stores a body the delegate can read.
pub struct FetchWork {
  pub label: String,
  pub duration_ms: u64,
  pub should_panic: bool,
  pub gauge: Arc<Gauge>,
  pub body: Mutex<Option<String>>,
}

impl Work for FetchWork {
  fn run<'a>(&'a self, cancel: &'a CancellationToken) -> WorkFuture<'a> {
    Box::pin(async move {
      let _running = self.gauge.enter(&self.label);
      let check_interval_ms = 10u64;
      let mut elapsed_ms = 0u64;

      while elapsed_ms < self.duration_ms {
        if cancel.is_cancelled() {
          tracing::info!("Fetch {} noticed cancellation.", self.label);
          return;
        }
        let step = check_interval_ms.min(self.duration_ms - elapsed_ms);
        sleep(Duration::from_millis(step)).await;
        elapsed_ms += step;
      }

      if self.should_panic {
        panic!("Fetch {} intentionally panicked!", self.label);
      }
      *self.body.lock().unwrap() = Some(format!("{}_body", self.label));
    })
  }
}

pub fn create_fetch(label: &str, duration_ms: u64, gauge: &Arc<Gauge>) -> Arc<Operation<FetchWork>> {
  Operation::new(FetchWork {
    label: label.to_string(),
    duration_ms,
    should_panic: false,
    gauge: gauge.clone(),
    body: Mutex::new(None),
  })
}

pub fn create_panicking_fetch(label: &str, gauge: &Arc<Gauge>) -> Arc<Operation<FetchWork>> {
  Operation::new(FetchWork {
    label: label.to_string(),
    duration_ms: 10,
    should_panic: true,
    gauge: gauge.clone(),
    body: Mutex::new(None),
  })
}

/// One record per delegate call.
#[derive(Debug, Clone)]
pub struct Notification {
  pub op_id: u64,
  pub tag: Option<String>,
  pub body: Option<String>,
  pub thread: std::thread::ThreadId,
}

// Helper for collecting notifications in tests
pub fn create_collecting_delegate() -> (
  Arc<Mutex<Vec<Notification>>>,
  impl Fn(Arc<Operation<FetchWork>>) + Send + Sync + 'static,
) {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let collected_in_delegate = collected.clone();
  let delegate = move |op: Arc<Operation<FetchWork>>| {
    tracing::debug!("Collecting delegate: operation {} finished (tag {:?}).", op.id(), op.tag());
    collected_in_delegate.lock().unwrap().push(Notification {
      op_id: op.id().as_u64(),
      tag: op.tag(),
      body: op.work().body.lock().unwrap().clone(),
      thread: std::thread::current().id(),
    });
  };
  (collected, delegate)
}

/// Polls `condition` every 5ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    sleep(Duration::from_millis(5)).await;
  }
  condition()
}

pub async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
  tokio::time::timeout(Duration::from_secs(5), future)
    .await
    .expect("test step timed out")
}

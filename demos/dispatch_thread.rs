use operations_runner::{DispatchThread, MainContext, Operation, OperationsRunner, RunnerConfig, Work, WorkFuture};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Delay(Duration);

impl Work for Delay {
  fn run<'a>(&'a self, _cancel: &'a CancellationToken) -> WorkFuture<'a> {
    Box::pin(tokio::time::sleep(self.0))
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Dispatch Thread Example ---");

  let ui_thread = DispatchThread::spawn("ui-thread").expect("failed to spawn ui thread");
  let (done_tx, done_rx) = mpsc::channel();

  let delegate = move |op: Arc<Operation<Delay>>| {
    info!(
      "Delegate on {:?}: {} finished",
      std::thread::current().name(),
      op.tag().unwrap_or_default()
    );
    let _ = done_tx.send(op.id());
  };

  let config = RunnerConfig::default()
    .with_name("dispatch_thread_demo")
    .with_max_ops(3)
    .with_main_context(MainContext::new());
  let runner = OperationsRunner::with_config(delegate, config, Handle::current());
  runner.set_delegate_thread(ui_thread.target());

  for i in 0..6u64 {
    let op = Operation::new(Delay(Duration::from_millis(50 * (i + 1))));
    runner
      .submit(op, format!("job {}", i))
      .expect("fresh operation must be admissible");
  }

  // Whatever is still running after 180ms is never reported.
  tokio::time::sleep(Duration::from_millis(180)).await;
  runner.cancel();
  info!("Cancelled. Registry size now {}.", runner.count());

  let delivered: Vec<_> = done_rx.try_iter().collect();
  info!("{} notifications were delivered before cancel().", delivered.len());

  drop(runner);
  drop(ui_thread);
  info!("--- Dispatch Thread Example End ---");
}

use operations_runner::{DispatchMode, Operation, OperationsRunner, RunnerConfig, Work, WorkFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pretends to download a page, one chunk every 100ms.
struct PageFetch {
  url: String,
  chunks: u32,
  body: Mutex<Vec<u8>>,
}

impl Work for PageFetch {
  fn run<'a>(&'a self, cancel: &'a CancellationToken) -> WorkFuture<'a> {
    Box::pin(async move {
      for chunk in 0..self.chunks {
        if cancel.is_cancelled() {
          info!("{}: stopping early", self.url);
          return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.body.lock().unwrap().extend_from_slice(format!("<chunk {}>", chunk).as_bytes());
      }
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example (max 2 concurrent fetches) ---");

  let finished = Arc::new(AtomicUsize::new(0));
  let delegate = {
    let finished = finished.clone();
    move |op: Arc<Operation<PageFetch>>| {
      let body_len = op.work().body.lock().unwrap().len();
      info!(
        "Delegate: {} ({}) finished with {} bytes",
        op.tag().unwrap_or_default(),
        op.work().url,
        body_len
      );
      finished.fetch_add(1, Ordering::SeqCst);
    }
  };

  let config = RunnerConfig::default()
    .with_name("basic_usage")
    .with_max_ops(2)
    .with_dispatch(DispatchMode::AnyContext);
  let runner = OperationsRunner::with_config(delegate, config, Handle::current());

  let urls = ["https://example.com/a", "https://example.com/b", "https://example.com/c", "https://example.com/d"];
  for (i, url) in urls.iter().enumerate() {
    let op = Operation::new(PageFetch {
      url: url.to_string(),
      chunks: 3,
      body: Mutex::new(Vec::new()),
    });
    if let Err(e) = runner.submit(op, format!("page #{}", i)) {
      tracing::error!("Failed to submit {}: {}", url, e);
    }
  }
  info!("Submitted {} fetches; {} in flight.", urls.len(), runner.count());

  runner.enumerate(|op| info!("In flight: {:?}", op));

  while finished.load(Ordering::SeqCst) < urls.len() {
    tokio::time::sleep(Duration::from_millis(50)).await;
  }

  info!("All fetches delivered. Registry size: {}", runner.count());
  runner.cancel();
  info!("--- Basic Usage Example End ---");
}

//! Fire-and-forget tasks for best-effort cache work.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::warn;

/// Detached tasks whose failures are logged and never reach a caller.
///
/// Responses never wait on these. `settle()` exists for the host to flush
/// pending writes before shutdown.
#[derive(Clone, Default)]
pub struct Background {
  handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Background {
  pub fn new() -> Self {
    Self::default()
  }

  fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    // A poisoned list is still a valid list of handles
    self.handles.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Spawn `future`, logging its error under `task` if it fails.
  pub fn spawn<Fut, E>(&self, task: &'static str, future: Fut)
  where
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
  {
    let handle = tokio::spawn(async move {
      if let Err(e) = future.await {
        warn!(task, error = %e, "Background task failed");
      }
    });

    let mut handles = self.handles();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Number of tasks not yet finished.
  pub fn pending(&self) -> usize {
    self.handles().iter().filter(|h| !h.is_finished()).count()
  }

  /// Wait until every spawned task, including ones spawned meanwhile, is done.
  pub async fn settle(&self) {
    loop {
      let batch = std::mem::take(&mut *self.handles());
      if batch.is_empty() {
        break;
      }
      for handle in batch {
        if let Err(e) = handle.await {
          warn!(error = %e, "Background task aborted");
        }
      }
    }
  }
}

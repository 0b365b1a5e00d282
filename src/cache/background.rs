//! Detached cache writes that never block the response path.

use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Tracks fire-and-forget cache writes.
///
/// Writes run as spawned tasks. Their failures are logged and counted here
/// instead of being returned to anyone.
#[derive(Clone, Default)]
pub struct BackgroundWrites {
  pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
  failures: Arc<AtomicU64>,
  completed: Arc<AtomicU64>,
}

impl BackgroundWrites {
  pub fn new() -> Self {
    Self::default()
  }

  /// Spawn a write. `label` identifies it in logs.
  pub fn spawn<F>(&self, label: String, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let failures = Arc::clone(&self.failures);
    let completed = Arc::clone(&self.completed);

    let handle = tokio::spawn(async move {
      match task.await {
        Ok(()) => {
          completed.fetch_add(1, Ordering::Relaxed);
          tracing::debug!(target: "roma_cache::background", "{} done", label);
        }
        Err(e) => {
          failures.fetch_add(1, Ordering::Relaxed);
          tracing::warn!(target: "roma_cache::background", "{} failed: {:#}", label, e);
        }
      }
    });

    if let Ok(mut pending) = self.pending.lock() {
      pending.retain(|h| !h.is_finished());
      pending.push(handle);
    }
  }

  /// Wait for every write spawned so far to finish.
  pub async fn settle(&self) {
    loop {
      let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
        Ok(mut pending) => pending.drain(..).collect(),
        Err(_) => return,
      };
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        // A panicked write is as good as a failed one
        if handle.await.is_err() {
          self.failures.fetch_add(1, Ordering::Relaxed);
        }
      }
    }
  }

  /// Number of writes that failed.
  pub fn failures(&self) -> u64 {
    self.failures.load(Ordering::Relaxed)
  }

  /// Number of writes that succeeded.
  pub fn completed(&self) -> u64 {
    self.completed.load(Ordering::Relaxed)
  }
}

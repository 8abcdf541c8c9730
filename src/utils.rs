use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            warn!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// A background task that lives exactly as long as this guard.
///
/// Dropping the guard cancels its token and aborts the task, so timers owned
/// by a component are released on every exit path, error exits included.
pub struct ScopedTask {
    name: &'static str,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScopedTask {
    /// Spawns `task`, handing it the cancellation token it should observe.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let future = task(cancel_token.clone());
        let handle = tokio::spawn(future);
        debug!("Background task '{}' started.", name);
        Self {
            name,
            cancel_token,
            handle: Some(handle),
        }
    }

    /// Runs `tick` every `period`, starting one period from now.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |cancel_token| async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = timer.tick() => tick().await,
                }
            }
        })
    }

    /// Lets the task run to completion on its own, waiting at most `limit`.
    /// Returns whether it finished; a task still running afterwards is aborted.
    pub async fn join(mut self, limit: Duration) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };
        match tokio::time::timeout(limit, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Background task '{}' still running after {:?}.", self.name, limit);
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        debug!("Background task '{}' released.", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn interval_task_stops_when_guard_drops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = ScopedTask::every("test-ticker", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(task);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn join_waits_for_natural_completion() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = drained.clone();
        let task = ScopedTask::spawn("test-drain", move |_| async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        for n in 0..3 {
            tx.send(n).unwrap();
        }
        drop(tx);
        assert!(task.join(Duration::from_secs(1)).await);
        assert_eq!(drained.load(Ordering::SeqCst), 3);

        let stuck = ScopedTask::spawn("test-stuck", |_| std::future::pending::<()>());
        assert!(!stuck.join(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_directory_exists(&nested).await.unwrap();
        assert!(nested.is_dir());
        ensure_directory_exists(&nested).await.unwrap();
    }
}

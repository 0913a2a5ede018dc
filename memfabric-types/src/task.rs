//! Small task helpers shared by components that run background work.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resets an in-flight flag when dropped.
pub struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// Sets `flag`, or returns `None` if it was already set.
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs `tick` every `interval_ms` (the first run one interval after
/// spawning) until `shutdown` turns true or its sender is dropped.
pub fn spawn_periodic<F, Fut>(
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn in_flight_is_exclusive_until_dropped() {
        let flag = AtomicBool::new(false);
        let guard = InFlight::acquire(&flag);
        assert!(guard.is_some());
        assert!(InFlight::acquire(&flag).is_none());
        drop(guard);
        assert!(InFlight::acquire(&flag).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_shutdown() {
        let (stop, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = spawn_periodic(100, rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        stop.send_replace(true);
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}

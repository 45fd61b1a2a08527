//! Auto-refresh scheduler
//!
//! One recurring tokio task per account. Every registration has a matching
//! cancellation path, and dropping the scheduler aborts whatever is still
//! running.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Per-account recurring background tasks
#[derive(Debug)]
pub(crate) struct RefreshScheduler {
    tasks: DashMap<String, JoinHandle<()>>,
    interval: Duration,
}

impl RefreshScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            interval,
        }
    }

    /// Start running `tick` every interval for the account
    ///
    /// The first tick fires one interval after scheduling. The task stops when
    /// `tick` returns `ControlFlow::Break`. Returns false if a live task is
    /// already registered for the account.
    pub fn schedule<F, Fut>(&self, account_id: &str, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let period = self.interval;
        let spawn = move || {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tick().await.is_break() {
                        break;
                    }
                }
            })
        };

        match self.tasks.entry(account_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_finished() => false,
            Entry::Occupied(mut entry) => {
                entry.insert(spawn());
                info!("Auto-refresh re-armed for {}", account_id);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(spawn());
                info!("Auto-refresh armed for {} every {:?}", account_id, period);
                true
            }
        }
    }

    /// Whether a live task is registered for the account
    pub fn is_scheduled(&self, account_id: &str) -> bool {
        self.tasks
            .get(account_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Abort the account's task
    pub fn cancel(&self, account_id: &str) -> bool {
        match self.tasks.remove(account_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!("Auto-refresh cancelled for {}", account_id);
                true
            }
            None => false,
        }
    }

    /// Abort every task, returning how many were registered
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        self.tasks.retain(|_, handle| {
            handle.abort();
            count += 1;
            false
        });
        if count > 0 {
            debug!("Cancelled {} auto-refresh tasks", count);
        }
        count
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_tick(counter: Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<ControlFlow<()>> {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(ControlFlow::Continue(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_interval() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(10));
        let ticks = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule("GABC", counting_tick(ticks.clone())));
        assert!(scheduler.is_scheduled("GABC"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent_per_account() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(1));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule("GABC", counting_tick(first.clone())));
        assert!(!scheduler.schedule("GABC", counting_tick(second.clone())));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.cancel_all(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(1));
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("GABC", counting_tick(ticks.clone()));
        scheduler.schedule("GXYZ", counting_tick(ticks.clone()));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel("GABC"));
        assert!(!scheduler.cancel("GABC"));
        assert!(!scheduler.is_scheduled("GABC"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert_eq!(scheduler.cancel_all(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_ends_task_and_allows_rearm() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(1));

        scheduler.schedule("GABC", || std::future::ready(ControlFlow::Break(())));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!scheduler.is_scheduled("GABC"));

        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.schedule("GABC", counting_tick(ticks.clone())));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}

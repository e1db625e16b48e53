//! Cancellable timers.
//!
//! Everything that used to be a nested chain of delayed callbacks (call
//! cleanup, goodbye windows, scheduled campaign starts, audio reconnects) is
//! expressed through [`TimerHandle`] or a keyed [`TimerSet`], so it can be
//! cancelled uniformly.

use core::future::Future;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A one-shot delayed task. Dropping the handle leaves the task running,
/// call [`TimerHandle::cancel`] to stop it before it fires.
pub struct TimerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Run `fut` after `delay` unless the returned handle is cancelled first.
pub fn after<F>(delay: Duration, fut: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let child = token.clone();
    let join = tokio::spawn(async move {
        tokio::select! {
            _ = child.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                fut.await;
            }
        }
    });
    TimerHandle { token, join }
}

struct TimerSetInner<K> {
    next_id: u64,
    timers: HashMap<K, (u64, TimerHandle)>,
}

/// Timers keyed by an id, at most one pending timer per key. Scheduling a
/// key that already has a pending timer replaces (cancels) the old one.
pub struct TimerSet<K> {
    inner: Arc<Mutex<TimerSetInner<K>>>,
}

impl<K> Clone for TimerSet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for TimerSet<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerSetInner {
                next_id: 0,
                timers: HashMap::new(),
            })),
        }
    }

    pub fn schedule<F>(&self, key: K, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        // hold the lock until the handle is stored, the spawned task removes
        // its own entry before running `fut`
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        let weak: Weak<Mutex<TimerSetInner<K>>> = Arc::downgrade(&self.inner);
        let child = token.clone();
        let task_key = key.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                let current = inner
                    .timers
                    .get(&task_key)
                    .map(|(timer_id, _)| *timer_id == id)
                    .unwrap_or(false);
                if current {
                    inner.timers.remove(&task_key);
                }
            }
            fut.await;
        });

        if let Some((_, old)) = inner.timers.insert(key, (id, TimerHandle { token, join }))
        {
            old.cancel();
        }
    }

    /// Cancel the pending timer for `key`, returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.lock().timers.remove(key) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let timers: Vec<(u64, TimerHandle)> =
            self.inner.lock().timers.drain().map(|(_, t)| t).collect();
        for (_, handle) in timers {
            handle.cancel();
        }
    }
}

/// Exponential backoff: attempt `n` (starting at 1) waits
/// `base * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before retry `attempt`, `None` once the attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(|attempt| self.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff =
            Backoff::new(Duration::from_millis(500), Duration::from_secs(3), 5);
        let delays: Vec<Duration> = backoff.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(3000),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(backoff.delay(0), None);
        assert_eq!(backoff.delay(6), None);
    }

    #[test]
    fn backoff_huge_attempts_do_not_overflow() {
        let backoff =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 100);
        assert_eq!(backoff.delay(64), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = after(Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = after(Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_set_replaces_pending_key() {
        let timers: TimerSet<String> = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.schedule("a".to_string(), Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        timers.schedule("a".to_string(), Duration::from_secs(10), async move {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_set_cancel() {
        let timers: TimerSet<u32> = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timers.schedule(1, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.contains(&1));
        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_can_reschedule_itself() {
        let timers: TimerSet<u32> = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let again = timers.clone();
        timers.schedule(7, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = counter.clone();
            again.schedule(7, Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.contains(&7));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}

// =============================================================================
// Bounded tick queue — evict-oldest on overflow
// =============================================================================
//
// Realtime events must never block the adapter's delivery context, so the
// queue drops the oldest tick when full and keeps the newest. The signal
// worker pops with a timeout so it can observe shutdown.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Default queue capacity.
pub const TICK_QUEUE_CAPACITY: usize = 5_000;

/// One debounced realtime price update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub code: String,
    pub price: i64,
}

pub struct TickQueue {
    inner: Mutex<VecDeque<Tick>>,
    capacity: usize,
    notify: Notify,
}

impl TickQueue {
    pub fn new() -> Self {
        Self::with_capacity(TICK_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Push a tick; when the queue is full the oldest entry is discarded so
    /// the newest data always gets through.
    pub fn push(&self, tick: Tick) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(tick);
        }
        self.notify.notify_one();
    }

    /// Pop the oldest tick, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Tick> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(tick) = self.inner.lock().pop_front() {
                return Some(tick);
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.inner.lock().pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for TickQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(code: &str, price: i64) -> Tick {
        Tick {
            code: code.into(),
            price,
        }
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = TickQueue::with_capacity(10);
        q.push(tick("005930", 1));
        q.push(tick("005930", 2));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await.unwrap().price, 1);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await.unwrap().price, 2);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let q = TickQueue::with_capacity(3);
        for p in 1..=5 {
            q.push(tick("005930", p));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await.unwrap().price, 3);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await.unwrap().price, 4);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)).await.unwrap().price, 5);
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let q = TickQueue::new();
        let popped = q.pop_timeout(Duration::from_millis(20)).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(TickQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(tick("000660", 99_000));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.price, 99_000);
    }
}

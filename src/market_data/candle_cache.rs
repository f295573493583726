// =============================================================================
// Candle cache + round-robin batch refresher
// =============================================================================
//
// The cache holds the latest daily candles per instrument with a 60 s TTL.
// A batch scheduler walks the watchlist with a round-robin cursor: every
// batch tick it takes the next 10 instruments, and the refresher spaces the
// individual fetches 350 ms apart so the TR queue is never flooded. At 200
// instruments a full rotation completes in about a minute, matching the TTL.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::Candle;

/// Instruments fetched per batch tick.
pub const BATCH_SIZE: usize = 10;
/// Candles requested per refresh (enough for a 20-day MA with slack).
pub const CANDLE_FETCH_COUNT: usize = 25;
/// Cache entries older than this are treated as missing.
const CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    candles: Vec<Candle>,
    updated_at: Instant,
}

/// TTL-based cache of daily candles per instrument.
pub struct CandleCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl CandleCache {
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Return a copy of the cached candles when they are still fresh.
    pub fn get_fresh(&self, code: &str) -> Option<Vec<Candle>> {
        let entries = self.entries.read();
        entries.get(code).and_then(|e| {
            if e.updated_at.elapsed() < self.ttl {
                Some(e.candles.clone())
            } else {
                None
            }
        })
    }

    /// True when a fresh entry exists (no copy-out).
    pub fn is_fresh(&self, code: &str) -> bool {
        let entries = self.entries.read();
        entries
            .get(code)
            .map(|e| e.updated_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Store the latest candles for `code`.
    pub fn update(&self, code: &str, candles: Vec<Candle>) {
        let mut entries = self.entries.write();
        entries.insert(
            code.to_string(),
            CacheEntry {
                candles,
                updated_at: Instant::now(),
            },
        );
    }

}

impl Default for CandleCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Batch scheduler
// =============================================================================

/// Round-robin cursor over the instruments whose candles are refreshed in
/// the background.
pub struct BatchScheduler {
    inner: Mutex<SchedulerInner>,
}

struct SchedulerInner {
    stocks: Vec<String>,
    cursor: usize,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                stocks: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Replace the instrument rotation; the cursor restarts at the front.
    pub fn set_stocks(&self, codes: Vec<String>) {
        let mut inner = self.inner.lock();
        inner.stocks = codes;
        inner.cursor = 0;
    }

    /// Next `BATCH_SIZE` instruments, wrapping around at the end.
    pub fn next_batch(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        if inner.stocks.is_empty() {
            return Vec::new();
        }
        let start = inner.cursor;
        let end = (start + BATCH_SIZE).min(inner.stocks.len());
        let batch = inner.stocks[start..end].to_vec();
        inner.cursor = if end >= inner.stocks.len() { 0 } else { end };
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().stocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().stocks.is_empty()
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: i64) -> Candle {
        Candle {
            date: "20250728".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
        }
    }

    #[test]
    fn cache_returns_fresh_and_expires() {
        let cache = CandleCache::with_ttl(Duration::from_millis(30));
        assert!(cache.get_fresh("005930").is_none());

        cache.update("005930", vec![candle(70_000)]);
        assert!(cache.is_fresh("005930"));
        assert_eq!(cache.get_fresh("005930").unwrap()[0].close, 70_000);

        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.is_fresh("005930"));
        assert!(cache.get_fresh("005930").is_none());
    }

    #[test]
    fn scheduler_round_robin_wraps() {
        let sched = BatchScheduler::new();
        let codes: Vec<String> = (0..25).map(|i| format!("{:06}", i)).collect();
        sched.set_stocks(codes.clone());

        let b1 = sched.next_batch();
        let b2 = sched.next_batch();
        let b3 = sched.next_batch();
        assert_eq!(b1, codes[0..10]);
        assert_eq!(b2, codes[10..20]);
        assert_eq!(b3, codes[20..25]);

        // Wrapped back to the front.
        let b4 = sched.next_batch();
        assert_eq!(b4, codes[0..10]);
    }

    #[test]
    fn scheduler_empty_batch() {
        let sched = BatchScheduler::new();
        assert!(sched.next_batch().is_empty());
    }

    #[test]
    fn full_rotation_covers_every_instrument() {
        let sched = BatchScheduler::new();
        let codes: Vec<String> = (0..200).map(|i| format!("{:06}", i)).collect();
        sched.set_stocks(codes.clone());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            for code in sched.next_batch() {
                seen.insert(code);
            }
        }
        assert_eq!(seen.len(), 200);
    }
}

// =============================================================================
// Market data plumbing: candle cache, debounce, subscriptions, tick queue
// =============================================================================

mod candle_cache;
mod debounce;
mod subscriptions;
mod tick_queue;

pub use candle_cache::{BatchScheduler, CandleCache, BATCH_SIZE, CANDLE_FETCH_COUNT};
pub use debounce::Debouncer;
pub use subscriptions::{
    SubscriptionAllocator, SubscriptionPlan, SLOT_CAPACITY, SLOT_COUNT, SLOT_SCREENS,
};
pub use tick_queue::{Tick, TickQueue};

use serde::{Deserialize, Serialize};

/// One daily OHLCV bar. Prices are integers in the currency's minor unit
/// (this market has no fractional prices). Sequences are most-recent-first
/// as delivered by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Trading date, `YYYYMMDD`.
    pub date: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
}

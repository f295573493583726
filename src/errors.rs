// =============================================================================
// Error taxonomy for the trading engine
// =============================================================================
//
// Policy (see coordinator / api modules):
//   - Orders retry up to `order_retry_count` with `order_retry_interval_ms`
//     between attempts; queries do not retry (the caller decides).
//   - A disconnect halts the decision loop; the reconnect timer re-opens it.
//   - `InvariantViolation` freezes the affected instrument until the next
//     startup sync.
//   - Errors inside a queue tick are logged and never tear down the queue.
// =============================================================================

use thiserror::Error;

/// Every failure condition the engine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradingError {
    #[error("not connected to the brokerage")]
    NotConnected,

    #[error("no trading account configured")]
    NoAccount,

    #[error("market is closed")]
    MarketClosed,

    /// Internal back-pressure from the sliding-window limiter. Transparent to
    /// callers: the dispatcher waits it out rather than surfacing it.
    #[error("rate limited")]
    RateLimited,

    #[error("adapter call failed with status {0}")]
    AdapterCallFailed(i32),

    #[error("order rejected with status {0}")]
    OrderRejected(i32),

    #[error("insufficient quantity for {inst}: requested {requested}, held {held}")]
    InsufficientQuantity {
        inst: String,
        requested: i64,
        held: i64,
    },

    #[error("position invariant violated for {inst}: {detail}")]
    InvariantViolation { inst: String, detail: String },

    #[error("no cached candles for {0}")]
    CacheMiss(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl TradingError {
    /// True for conditions the order path is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdapterCallFailed(_) | Self::OrderRejected(_) | Self::Timeout(_)
        )
    }
}

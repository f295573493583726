// =============================================================================
// TradingContext — everything the engine shares, constructed once
// =============================================================================
//
// No globals: every store, queue, and handle is built in `main` (or a test)
// and carried through an `Arc<TradingContext>`. Subsystems that manage their
// own interior mutability sit behind plain `Arc`s; the few coordinator-owned
// bits (subscription allocator, account id) use parking_lot locks.
// =============================================================================

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::api::ApiHandle;
use crate::broker::{BrokerAdapter, NameCache};
use crate::config_store::ConfigStore;
use crate::errors::TradingError;
use crate::market_data::{
    BatchScheduler, Candle, CandleCache, Debouncer, SubscriptionAllocator, TickQueue,
    CANDLE_FETCH_COUNT,
};
use crate::market_hours::Clock;
use crate::order_ledger::OrderLedger;
use crate::position_store::PositionStore;

pub struct TradingContext {
    pub config: Arc<ConfigStore>,
    pub positions: Arc<PositionStore>,
    pub ledger: Arc<OrderLedger>,

    pub candles: Arc<CandleCache>,
    pub scheduler: Arc<BatchScheduler>,
    pub debouncer: Arc<Debouncer>,
    pub tick_queue: Arc<TickQueue>,
    pub allocator: Mutex<SubscriptionAllocator>,
    pub names: Arc<NameCache>,

    pub api: ApiHandle,
    pub broker: Arc<dyn BrokerAdapter>,

    pub account: RwLock<Option<String>>,
    pub clock: Clock,

    stop_tx: watch::Sender<bool>,
}

impl TradingContext {
    pub fn new(
        config: Arc<ConfigStore>,
        broker: Arc<dyn BrokerAdapter>,
        api: ApiHandle,
        clock: Clock,
    ) -> Self {
        let positions = Arc::new(PositionStore::new(config.clone()));
        let ledger = Arc::new(OrderLedger::new(config.clone()));
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            positions,
            ledger,
            candles: Arc::new(CandleCache::new()),
            scheduler: Arc::new(BatchScheduler::new()),
            debouncer: Arc::new(Debouncer::new()),
            tick_queue: Arc::new(TickQueue::new()),
            allocator: Mutex::new(SubscriptionAllocator::new()),
            names: Arc::new(NameCache::new()),
            api,
            broker,
            account: RwLock::new(None),
            clock,
            stop_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    pub fn account(&self) -> Result<String, TradingError> {
        self.account.read().clone().ok_or(TradingError::NoAccount)
    }

    pub fn set_account(&self, account: &str) {
        *self.account.write() = Some(account.to_string());
        self.config.set_account_number(account);
    }

    // -------------------------------------------------------------------------
    // Session clock
    // -------------------------------------------------------------------------

    /// Broker keeps orders / engine is awake (pre-market included).
    pub fn is_market_open(&self) -> bool {
        self.clock.is_market_open()
    }

    /// Regular session: the only window in which orders are actually sent.
    pub fn is_trading_time(&self) -> bool {
        self.clock.is_trading_time()
    }

    // -------------------------------------------------------------------------
    // Shutdown signal
    // -------------------------------------------------------------------------

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// Cached candles, falling back to an on-demand fetch through the TR
    /// queue. The signal worker never calls this — it runs cache-only so a
    /// tick can never stall on the wire.
    pub async fn candles_for(&self, code: &str) -> Result<Vec<Candle>, TradingError> {
        if let Some(candles) = self.candles.get_fresh(code) {
            return Ok(candles);
        }
        let owned = code.to_string();
        let fetched = self
            .api
            .query(move |b| async move { b.daily_candles(&owned, CANDLE_FETCH_COUNT).await })
            .await?;
        if fetched.is_empty() {
            return Err(TradingError::CacheMiss(code.to_string()));
        }
        self.candles.update(code, fetched.clone());
        Ok(fetched)
    }
}

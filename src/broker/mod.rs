// =============================================================================
// Brokerage adapter seam — trait, event variants, and shared DTOs
// =============================================================================
//
// The engine never talks to a wire protocol directly: every brokerage
// operation goes through `BrokerAdapter`, and everything the brokerage pushes
// back arrives as a `BrokerEvent` on a channel. Events are tagged variants,
// not callback objects, so the coordinator owns a single receive loop.
//
// All adapter calls are serialized by the API dispatch task (see `api`); an
// implementation may assume it is never called concurrently.
// =============================================================================

mod paper;

pub use paper::PaperBroker;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::TradingError;
use crate::market_data::Candle;
use crate::types::{OrderSide, PriceKind, ServerKind};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the brokerage pushes to the engine.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Realtime trade print for a subscribed instrument.
    RealtimePrice { code: String, price: i64, volume: i64 },
    /// Post-trade order update (a fill or a status change).
    Order(OrderEvent),
    /// Authoritative balance mutation for one instrument.
    Balance {
        code: String,
        quantity: i64,
        avg_price: i64,
    },
    /// Informational message attached to a request.
    Message {
        screen: String,
        rq_name: String,
        tr_code: String,
        msg: String,
    },
    /// The session dropped; the decision loop must halt until reconnect.
    Disconnected,
}

/// Order-status half of the post-trade feed.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub code: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub order_quantity: i64,
    pub executed_quantity: i64,
    pub executed_price: i64,
    pub order_no: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

/// What `send_order` is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Buy,
    Sell,
    CancelBuy,
    CancelSell,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub action: OrderAction,
    pub account: String,
    pub code: String,
    pub quantity: i64,
    /// Limit price; ignored for market orders.
    pub price: i64,
    pub price_kind: PriceKind,
    /// Original order number, required for cancels.
    pub original_order_no: Option<String>,
}

impl OrderRequest {
    pub fn limit(action: OrderAction, account: &str, code: &str, quantity: i64, price: i64) -> Self {
        Self {
            action,
            account: account.to_string(),
            code: code.to_string(),
            quantity,
            price,
            price_kind: PriceKind::Limit,
            original_order_no: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StockInfo {
    pub code: String,
    pub name: String,
    pub price: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub volume: i64,
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub code: String,
    pub name: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub current_price: i64,
    pub eval_amount: i64,
    pub profit: i64,
    pub profit_rate_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AccountBalance {
    pub deposit: i64,
    pub total_purchase: i64,
    pub total_eval: i64,
    pub total_profit: i64,
    pub profit_rate_pct: f64,
    pub holdings: Vec<Holding>,
}

#[derive(Debug, Clone, Default)]
pub struct DepositDetail {
    pub deposit: i64,
    pub deposit_d1: i64,
    pub deposit_d2: i64,
    pub available: i64,
    pub order_available: i64,
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_no: String,
    pub code: String,
    pub name: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: i64,
    pub unfilled_qty: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub code: String,
    pub name: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: i64,
    pub amount: i64,
    /// Execution time, `HHMMSS`.
    pub time: String,
    pub order_no: String,
}

/// How `subscribe_realtime` treats the slot's existing registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    Replace,
    Append,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Operations the engine needs from a brokerage session.
///
/// `send_order` returns the brokerage status code: `0` is accepted, anything
/// else is a rejection to be retried or surfaced.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Open the session. Events begin flowing to the attached sink once this
    /// returns `true`.
    async fn connect(&self) -> Result<bool, TradingError>;

    fn is_connected(&self) -> bool;

    fn server_kind(&self) -> ServerKind;

    /// Register the engine's event sink. Called once before `connect`.
    fn attach_events(&self, sink: UnboundedSender<BrokerEvent>);

    async fn accounts(&self) -> Result<Vec<String>, TradingError>;

    async fn subscribe_realtime(
        &self,
        screen: &str,
        codes: &[String],
        mode: SubscribeMode,
    ) -> Result<(), TradingError>;

    /// `code = None` clears the whole slot.
    async fn unsubscribe_realtime(&self, screen: &str, code: Option<&str>)
        -> Result<(), TradingError>;

    async fn stock_info(&self, code: &str) -> Result<StockInfo, TradingError>;

    /// Daily candles, most-recent-first.
    async fn daily_candles(&self, code: &str, count: usize) -> Result<Vec<Candle>, TradingError>;

    async fn balance(&self, account: &str) -> Result<AccountBalance, TradingError>;

    async fn deposit_detail(&self, account: &str) -> Result<DepositDetail, TradingError>;

    async fn send_order(&self, request: OrderRequest) -> Result<i32, TradingError>;

    async fn open_orders(&self, account: &str) -> Result<Vec<OpenOrder>, TradingError>;

    async fn today_executions(&self, account: &str) -> Result<Vec<ExecutionInfo>, TradingError>;

    async fn cancel_all_for_instrument(&self, account: &str, code: &str)
        -> Result<u32, TradingError>;

    async fn cancel_buys_for_instrument(
        &self,
        account: &str,
        code: &str,
    ) -> Result<u32, TradingError>;

    async fn cancel_sells_for_instrument(
        &self,
        account: &str,
        code: &str,
    ) -> Result<u32, TradingError>;

    async fn cancel_buys_except_holdings(
        &self,
        account: &str,
        held: &[String],
    ) -> Result<u32, TradingError>;
}

// ---------------------------------------------------------------------------
// Name cache
// ---------------------------------------------------------------------------

/// Pure memoization of `ticker → display name`. The brokerage resolves names
/// over the wire; the engine asks often (logs, summaries), so lookups are
/// cached for the life of the process.
#[derive(Default)]
pub struct NameCache {
    names: RwLock<HashMap<String, String>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: &str) -> Option<String> {
        self.names.read().get(code).cloned()
    }

    pub fn insert(&self, code: &str, name: &str) {
        if !name.is_empty() {
            self.names.write().insert(code.to_string(), name.to_string());
        }
    }

    /// Cached name, or `code` itself when the name is unknown.
    pub fn display(&self, code: &str) -> String {
        self.get(code).unwrap_or_else(|| code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_cache_memoizes() {
        let cache = NameCache::new();
        assert_eq!(cache.display("005930"), "005930");
        cache.insert("005930", "삼성전자");
        assert_eq!(cache.display("005930"), "삼성전자");
        // Empty names never overwrite.
        cache.insert("005930", "");
        assert_eq!(cache.display("005930"), "삼성전자");
    }
}

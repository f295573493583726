// =============================================================================
// Paper broker — in-process simulated brokerage session
// =============================================================================
//
// Holds resting limit orders and fills them when an injected price crosses
// the limit, emitting the same order/balance event sequence the real
// brokerage produces (order fill first, then the authoritative balance
// mutation). Used by the default binary when no live session is configured
// and by the end-to-end scenario tests.
//
// Fills are all-or-nothing per order; partial-fill behaviour is exercised
// directly against the execution handler in its own tests.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::errors::TradingError;
use crate::market_data::Candle;
use crate::types::{OrderSide, PriceKind, ServerKind};

use super::{
    AccountBalance, BrokerAdapter, BrokerEvent, DepositDetail, ExecutionInfo, Holding, OpenOrder,
    OrderAction, OrderEvent, OrderRequest, OrderStatus, StockInfo, SubscribeMode,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    order_no: String,
    code: String,
    side: OrderSide,
    quantity: i64,
    price: i64,
    unfilled: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct HoldingState {
    quantity: i64,
    avg_price: i64,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    accounts: Vec<String>,
    deposit: i64,
    names: HashMap<String, String>,
    candles: HashMap<String, Vec<Candle>>,
    prices: HashMap<String, i64>,
    holdings: HashMap<String, HoldingState>,
    open_orders: Vec<PaperOrder>,
    subscriptions: HashMap<String, HashSet<String>>,
    executions: Vec<ExecutionInfo>,
    next_order_no: u64,
}

pub struct PaperBroker {
    inner: Mutex<Inner>,
    events: Mutex<Option<UnboundedSender<BrokerEvent>>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        let inner = Inner {
            accounts: vec!["8000000011".to_string()],
            deposit: 10_000_000,
            next_order_no: 1,
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
            events: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Seeding (test / demo setup)
    // -------------------------------------------------------------------------

    pub fn set_candles(&self, code: &str, candles: Vec<Candle>) {
        self.inner.lock().candles.insert(code.to_string(), candles);
    }

    pub fn set_name(&self, code: &str, name: &str) {
        self.inner
            .lock()
            .names
            .insert(code.to_string(), name.to_string());
    }

    /// Seed an existing holding (e.g. for restart scenarios).
    pub fn seed_holding(&self, code: &str, quantity: i64, avg_price: i64) {
        self.inner.lock().holdings.insert(
            code.to_string(),
            HoldingState {
                quantity,
                avg_price,
            },
        );
    }

    /// Number of resting (unfilled) orders, for assertions.
    pub fn open_order_count(&self) -> usize {
        self.inner.lock().open_orders.len()
    }

    // -------------------------------------------------------------------------
    // Price injection
    // -------------------------------------------------------------------------

    /// Inject a trade print: updates the last price, emits a realtime event
    /// for subscribed instruments, and fills any resting order the price
    /// crosses.
    pub fn tick(&self, code: &str, price: i64) {
        let mut fills = Vec::new();
        let subscribed;
        {
            let mut inner = self.inner.lock();
            inner.prices.insert(code.to_string(), price);
            subscribed = inner
                .subscriptions
                .values()
                .any(|slot| slot.contains(code));

            let mut remaining = Vec::new();
            for order in inner.open_orders.drain(..) {
                let crossed = order.code == code
                    && match order.side {
                        OrderSide::Buy => price <= order.price,
                        OrderSide::Sell => price >= order.price,
                    };
                if crossed {
                    fills.push(order);
                } else {
                    remaining.push(order);
                }
            }
            inner.open_orders = remaining;
        }

        if subscribed {
            self.emit(BrokerEvent::RealtimePrice {
                code: code.to_string(),
                price,
                volume: 0,
            });
        }

        for order in fills {
            self.settle_fill(order);
        }
    }

    fn settle_fill(&self, order: PaperOrder) {
        let (quantity, avg_price) = {
            let mut inner = self.inner.lock();
            let mut holding = inner.holdings.get(&order.code).copied().unwrap_or_default();
            match order.side {
                OrderSide::Buy => {
                    let total = holding.quantity + order.unfilled;
                    if total > 0 {
                        holding.avg_price = (holding.avg_price * holding.quantity
                            + order.price * order.unfilled)
                            / total;
                    }
                    holding.quantity = total;
                }
                OrderSide::Sell => {
                    holding.quantity = (holding.quantity - order.unfilled).max(0);
                    if holding.quantity == 0 {
                        holding.avg_price = 0;
                    }
                }
            }
            inner.holdings.insert(order.code.clone(), holding);

            let name = inner
                .names
                .get(&order.code)
                .cloned()
                .unwrap_or_else(|| order.code.clone());
            inner.executions.push(ExecutionInfo {
                code: order.code.clone(),
                name,
                side: order.side,
                quantity: order.unfilled,
                price: order.price,
                amount: order.price * order.unfilled,
                time: "000000".to_string(),
                order_no: order.order_no.clone(),
            });

            (holding.quantity, holding.avg_price)
        };

        info!(
            code = %order.code,
            side = %order.side,
            qty = order.unfilled,
            price = order.price,
            "paper fill"
        );

        self.emit(BrokerEvent::Order(OrderEvent {
            code: order.code.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            order_quantity: order.quantity,
            executed_quantity: order.unfilled,
            executed_price: order.price,
            order_no: order.order_no,
        }));
        self.emit(BrokerEvent::Balance {
            code: order.code,
            quantity,
            avg_price,
        });
    }

    /// Drop the session; subsequent calls fail fast with `NotConnected`.
    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
        self.emit(BrokerEvent::Disconnected);
    }

    fn emit(&self, event: BrokerEvent) {
        if let Some(sink) = self.events.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn check_connected(&self) -> Result<(), TradingError> {
        if self.inner.lock().connected {
            Ok(())
        } else {
            Err(TradingError::NotConnected)
        }
    }

    fn cancel_where(&self, predicate: impl Fn(&PaperOrder) -> bool) -> u32 {
        let mut inner = self.inner.lock();
        let before = inner.open_orders.len();
        inner.open_orders.retain(|o| !predicate(o));
        (before - inner.open_orders.len()) as u32
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn connect(&self) -> Result<bool, TradingError> {
        self.inner.lock().connected = true;
        debug!("paper broker session opened");
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn server_kind(&self) -> ServerKind {
        ServerKind::Paper
    }

    fn attach_events(&self, sink: UnboundedSender<BrokerEvent>) {
        *self.events.lock() = Some(sink);
    }

    async fn accounts(&self) -> Result<Vec<String>, TradingError> {
        self.check_connected()?;
        Ok(self.inner.lock().accounts.clone())
    }

    async fn subscribe_realtime(
        &self,
        screen: &str,
        codes: &[String],
        mode: SubscribeMode,
    ) -> Result<(), TradingError> {
        self.check_connected()?;
        let mut inner = self.inner.lock();
        let slot = inner.subscriptions.entry(screen.to_string()).or_default();
        if mode == SubscribeMode::Replace {
            slot.clear();
        }
        slot.extend(codes.iter().cloned());
        Ok(())
    }

    async fn unsubscribe_realtime(
        &self,
        screen: &str,
        code: Option<&str>,
    ) -> Result<(), TradingError> {
        self.check_connected()?;
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.subscriptions.get_mut(screen) {
            match code {
                Some(c) => {
                    slot.remove(c);
                }
                None => slot.clear(),
            }
        }
        Ok(())
    }

    async fn stock_info(&self, code: &str) -> Result<StockInfo, TradingError> {
        self.check_connected()?;
        let inner = self.inner.lock();
        let price = inner.prices.get(code).copied().unwrap_or(0);
        Ok(StockInfo {
            code: code.to_string(),
            name: inner.names.get(code).cloned().unwrap_or_default(),
            price,
            open: price,
            high: price,
            low: price,
            volume: 0,
        })
    }

    async fn daily_candles(&self, code: &str, count: usize) -> Result<Vec<Candle>, TradingError> {
        self.check_connected()?;
        let inner = self.inner.lock();
        match inner.candles.get(code) {
            Some(candles) => Ok(candles.iter().take(count).cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn balance(&self, _account: &str) -> Result<AccountBalance, TradingError> {
        self.check_connected()?;
        let inner = self.inner.lock();
        let holdings: Vec<Holding> = inner
            .holdings
            .iter()
            .filter(|(_, h)| h.quantity > 0)
            .map(|(code, h)| {
                let current = inner.prices.get(code).copied().unwrap_or(h.avg_price);
                let eval = current * h.quantity;
                let cost = h.avg_price * h.quantity;
                Holding {
                    code: code.clone(),
                    name: inner.names.get(code).cloned().unwrap_or_else(|| code.clone()),
                    quantity: h.quantity,
                    avg_price: h.avg_price,
                    current_price: current,
                    eval_amount: eval,
                    profit: eval - cost,
                    profit_rate_pct: if cost > 0 {
                        (eval - cost) as f64 / cost as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        let total_purchase: i64 = holdings.iter().map(|h| h.avg_price * h.quantity).sum();
        let total_eval: i64 = holdings.iter().map(|h| h.eval_amount).sum();
        Ok(AccountBalance {
            deposit: inner.deposit,
            total_purchase,
            total_eval,
            total_profit: total_eval - total_purchase,
            profit_rate_pct: if total_purchase > 0 {
                (total_eval - total_purchase) as f64 / total_purchase as f64 * 100.0
            } else {
                0.0
            },
            holdings,
        })
    }

    async fn deposit_detail(&self, _account: &str) -> Result<DepositDetail, TradingError> {
        self.check_connected()?;
        let deposit = self.inner.lock().deposit;
        Ok(DepositDetail {
            deposit,
            deposit_d1: deposit,
            deposit_d2: deposit,
            available: deposit,
            order_available: deposit,
        })
    }

    async fn send_order(&self, request: OrderRequest) -> Result<i32, TradingError> {
        self.check_connected()?;

        match request.action {
            OrderAction::CancelBuy | OrderAction::CancelSell => {
                let side = if request.action == OrderAction::CancelBuy {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                let cancelled = self.cancel_where(|o| {
                    o.side == side
                        && o.code == request.code
                        && request
                            .original_order_no
                            .as_ref()
                            .map(|no| *no == o.order_no)
                            .unwrap_or(true)
                });
                if cancelled == 0 {
                    warn!(code = %request.code, "paper cancel matched no resting order");
                }
                return Ok(0);
            }
            OrderAction::Buy | OrderAction::Sell => {}
        }

        if request.quantity <= 0 {
            return Ok(-308);
        }
        let side = if request.action == OrderAction::Buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        if side == OrderSide::Sell {
            let held = self
                .inner
                .lock()
                .holdings
                .get(&request.code)
                .map(|h| h.quantity)
                .unwrap_or(0);
            let resting: i64 = self
                .inner
                .lock()
                .open_orders
                .iter()
                .filter(|o| o.code == request.code && o.side == OrderSide::Sell)
                .map(|o| o.unfilled)
                .sum();
            if request.quantity + resting > held {
                return Err(TradingError::InsufficientQuantity {
                    inst: request.code.clone(),
                    requested: request.quantity + resting,
                    held,
                });
            }
        }

        let (order, last_price) = {
            let mut inner = self.inner.lock();
            let order_no = format!("{:07}", inner.next_order_no);
            inner.next_order_no += 1;
            let last_price = inner.prices.get(&request.code).copied();
            let price = match request.price_kind {
                PriceKind::Limit => request.price,
                PriceKind::Market => last_price.unwrap_or(request.price),
            };
            let order = PaperOrder {
                order_no,
                code: request.code.clone(),
                side,
                quantity: request.quantity,
                price,
                unfilled: request.quantity,
            };
            inner.open_orders.push(order.clone());
            (order, last_price)
        };

        debug!(
            code = %order.code,
            side = %order.side,
            qty = order.quantity,
            price = order.price,
            order_no = %order.order_no,
            "paper order accepted"
        );

        // A limit that already crosses the market (or a market order) fills
        // against the last known price immediately.
        if let Some(px) = last_price {
            let crosses = request.price_kind == PriceKind::Market
                || match side {
                    OrderSide::Buy => px <= order.price,
                    OrderSide::Sell => px >= order.price,
                };
            if crosses {
                let popped = {
                    let mut inner = self.inner.lock();
                    let pos = inner
                        .open_orders
                        .iter()
                        .position(|o| o.order_no == order.order_no);
                    pos.map(|i| inner.open_orders.remove(i))
                };
                if let Some(o) = popped {
                    self.settle_fill(o);
                }
            }
        }

        Ok(0)
    }

    async fn open_orders(&self, _account: &str) -> Result<Vec<OpenOrder>, TradingError> {
        self.check_connected()?;
        let inner = self.inner.lock();
        Ok(inner
            .open_orders
            .iter()
            .filter(|o| o.unfilled > 0)
            .map(|o| OpenOrder {
                order_no: o.order_no.clone(),
                code: o.code.clone(),
                name: inner.names.get(&o.code).cloned().unwrap_or_else(|| o.code.clone()),
                side: o.side,
                quantity: o.quantity,
                price: o.price,
                unfilled_qty: o.unfilled,
            })
            .collect())
    }

    async fn today_executions(&self, _account: &str) -> Result<Vec<ExecutionInfo>, TradingError> {
        self.check_connected()?;
        Ok(self.inner.lock().executions.clone())
    }

    async fn cancel_all_for_instrument(
        &self,
        _account: &str,
        code: &str,
    ) -> Result<u32, TradingError> {
        self.check_connected()?;
        Ok(self.cancel_where(|o| o.code == code))
    }

    async fn cancel_buys_for_instrument(
        &self,
        _account: &str,
        code: &str,
    ) -> Result<u32, TradingError> {
        self.check_connected()?;
        Ok(self.cancel_where(|o| o.code == code && o.side == OrderSide::Buy))
    }

    async fn cancel_sells_for_instrument(
        &self,
        _account: &str,
        code: &str,
    ) -> Result<u32, TradingError> {
        self.check_connected()?;
        Ok(self.cancel_where(|o| o.code == code && o.side == OrderSide::Sell))
    }

    async fn cancel_buys_except_holdings(
        &self,
        _account: &str,
        held: &[String],
    ) -> Result<u32, TradingError> {
        self.check_connected()?;
        let held: HashSet<&String> = held.iter().collect();
        Ok(self.cancel_where(|o| o.side == OrderSide::Buy && !held.contains(&o.code)))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connected_broker() -> (PaperBroker, mpsc::UnboundedReceiver<BrokerEvent>) {
        let broker = PaperBroker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.attach_events(tx);
        (broker, rx)
    }

    #[tokio::test]
    async fn limit_buy_rests_until_price_crosses() {
        let (broker, mut rx) = connected_broker();
        broker.connect().await.unwrap();
        broker.tick("005930", 8_200);

        let req = OrderRequest::limit(OrderAction::Buy, "8000000011", "005930", 10, 8_050);
        assert_eq!(broker.send_order(req).await.unwrap(), 0);
        assert_eq!(broker.open_order_count(), 1);

        broker.tick("005930", 8_050);
        assert_eq!(broker.open_order_count(), 0);

        // Fill event then balance event.
        let mut saw_fill = false;
        let mut saw_balance = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                BrokerEvent::Order(o) => {
                    assert_eq!(o.executed_quantity, 10);
                    assert_eq!(o.executed_price, 8_050);
                    saw_fill = true;
                }
                BrokerEvent::Balance {
                    quantity,
                    avg_price,
                    ..
                } => {
                    assert_eq!(quantity, 10);
                    assert_eq!(avg_price, 8_050);
                    saw_balance = true;
                }
                _ => {}
            }
        }
        assert!(saw_fill && saw_balance);
    }

    #[tokio::test]
    async fn sell_rejected_beyond_holdings() {
        let (broker, _rx) = connected_broker();
        broker.connect().await.unwrap();
        broker.seed_holding("005930", 5, 8_000);

        let req = OrderRequest::limit(OrderAction::Sell, "8000000011", "005930", 10, 8_500);
        let err = broker.send_order(req).await.unwrap_err();
        assert!(matches!(err, TradingError::InsufficientQuantity { .. }));
    }

    #[tokio::test]
    async fn cancel_buys_except_holdings_spares_held() {
        let (broker, _rx) = connected_broker();
        broker.connect().await.unwrap();
        broker
            .send_order(OrderRequest::limit(OrderAction::Buy, "a", "005930", 1, 1_000))
            .await
            .unwrap();
        broker
            .send_order(OrderRequest::limit(OrderAction::Buy, "a", "000660", 1, 1_000))
            .await
            .unwrap();

        let cancelled = broker
            .cancel_buys_except_holdings("a", &["005930".to_string()])
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(broker.open_order_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_fails_fast() {
        let (broker, _rx) = connected_broker();
        broker.connect().await.unwrap();
        broker.disconnect();
        assert!(matches!(
            broker.accounts().await,
            Err(TradingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn averages_across_pyramided_buys() {
        let (broker, _rx) = connected_broker();
        broker.connect().await.unwrap();
        broker.tick("005930", 9_000);
        broker
            .send_order(OrderRequest::limit(OrderAction::Buy, "a", "005930", 10, 8_000))
            .await
            .unwrap();
        broker
            .send_order(OrderRequest::limit(OrderAction::Buy, "a", "005930", 10, 6_000))
            .await
            .unwrap();
        broker.tick("005930", 6_000);

        // Both rungs crossed at 6,000: the 8,000 limit and the 6,000 limit.
        let bal = broker.balance("a").await.unwrap();
        assert_eq!(bal.holdings.len(), 1);
        assert_eq!(bal.holdings[0].quantity, 20);
        assert_eq!(bal.holdings[0].avg_price, 7_000);
    }
}

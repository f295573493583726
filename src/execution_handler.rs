// =============================================================================
// ExecutionHandler — folds broker post-trade events back into engine state
// =============================================================================
//
// Two event kinds arrive from the brokerage after a trade:
//
//   - order events: a fill happened (quantity, price). Used to identify
//     WHICH intended order filled (ledger match by price) and to keep the
//     audit log.
//   - balance events: the authoritative new quantity / average price. These
//     drive the position state machine and its side-effects: ladder
//     placement after buys, auto-vs-manual disambiguation after sells,
//     close-out bookkeeping.
//
// Sell classification: a sell fill whose price matches a ledger rung is
// automatic — the rung is marked sold and the other rungs stay resting. A
// fill with no ledger match is a manual sell — the remaining rungs are
// cancelled and re-placed against the reduced quantity.
//
// Nothing here blocks the event loop on the wire directly: all broker calls
// go through the dispatch queues.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config_store::ExecutionRecord;
use crate::context::TradingContext;
use crate::errors::TradingError;
use crate::order_ledger::PendingOrder;
use crate::position_store::BalanceTransition;
use crate::signal_engine::{BuySignal, SignalEngine};
use crate::broker::{OrderAction, OrderEvent, OrderRequest};
use crate::ta;
use crate::types::{OrderSide, TargetName};

pub struct ExecutionHandler {
    ctx: Arc<TradingContext>,
    /// Instruments whose last sell fill matched a ladder rung; consumed by
    /// the following balance event to skip the manual-sell recompute.
    auto_sell: Mutex<HashSet<String>>,
}

impl ExecutionHandler {
    pub fn new(ctx: Arc<TradingContext>) -> Self {
        Self {
            ctx,
            auto_sell: Mutex::new(HashSet::new()),
        }
    }

    // =========================================================================
    // Order events
    // =========================================================================

    pub async fn on_order_event(&self, ev: &OrderEvent) {
        if ev.executed_quantity <= 0 {
            return;
        }
        let code = &ev.code;
        info!(
            code = %code,
            side = %ev.side,
            qty = ev.executed_quantity,
            price = ev.executed_price,
            order_no = %ev.order_no,
            "fill received"
        );

        self.ctx.config.save_execution(
            code,
            ExecutionRecord {
                side: ev.side,
                quantity: ev.executed_quantity,
                price: ev.executed_price,
                time: Local::now().format("%H%M%S").to_string(),
                order_no: ev.order_no.clone(),
            },
            None,
        );

        match ev.side {
            OrderSide::Buy => self.on_buy_fill(code, ev).await,
            OrderSide::Sell => self.on_sell_fill(code, ev).await,
        }
    }

    async fn on_buy_fill(&self, code: &str, ev: &OrderEvent) {
        // Running average of this buy cycle's fills.
        self.ctx.positions.with_position(code, |p| {
            if p.last_executed_qty > 0 && p.last_executed_price > 0 {
                let total = p.last_executed_qty + ev.executed_quantity;
                p.last_executed_price = (p.last_executed_price * p.last_executed_qty
                    + ev.executed_price * ev.executed_quantity)
                    / total;
                p.last_executed_qty = total;
            } else {
                p.last_executed_price = ev.executed_price;
                p.last_executed_qty = ev.executed_quantity;
            }
        });

        // Which staged buy was this? The ledger entry at this price knows.
        if let Some(entry) = self
            .ctx
            .ledger
            .find_at_price(code, OrderSide::Buy, ev.executed_price)
        {
            if let Some(buy_count) = entry.buy_count {
                self.ctx.positions.with_position(code, |p| {
                    if buy_count > p.buy_count {
                        p.buy_count = buy_count;
                        info!(code, buy_count, "staged buy fill confirmed");
                    }
                });
            }
        }
        self.ctx
            .ledger
            .remove_matching(code, OrderSide::Buy, Some(ev.executed_price), None);

        self.check_and_cancel_excess_orders().await;
    }

    async fn on_sell_fill(&self, code: &str, ev: &OrderEvent) {
        let matched = self
            .ctx
            .ledger
            .find_at_price(code, OrderSide::Sell, ev.executed_price);

        match matched.as_ref().and_then(|e| e.target_name) {
            Some(target) => {
                // Automatic: one of our rungs filled.
                if self.ctx.positions.mark_sold_target(code, target) {
                    info!(code, %target, "ladder rung sold");
                }
                self.auto_sell.lock().insert(code.to_string());
                // Any sell freezes pyramiding: take the staged buys down.
                self.cancel_pending_buys(code).await;
            }
            None => {
                info!(code, price = ev.executed_price, "manual sell fill detected");
            }
        }

        // A partially filled stop-loss keeps working for the remainder, so
        // its ledger entry shrinks instead of disappearing. Everything else
        // is removed on the first fill at its price.
        match matched {
            Some(entry)
                if entry.target_name == Some(TargetName::StopLoss)
                    && ev.executed_quantity < entry.quantity =>
            {
                self.ctx
                    .ledger
                    .update_stoploss_quantity(code, entry.quantity - ev.executed_quantity);
            }
            _ => {
                self.ctx
                    .ledger
                    .remove_matching(code, OrderSide::Sell, Some(ev.executed_price), None);
            }
        }
    }

    // =========================================================================
    // Balance events — the FSM driver
    // =========================================================================

    pub async fn on_balance_event(&self, code: &str, quantity: i64, avg_price: i64) {
        let transition = match self.ctx.positions.apply_balance(code, quantity, avg_price) {
            Ok(t) => t,
            Err(TradingError::InvariantViolation { inst, detail }) => {
                // Already logged and frozen by the store; no side-effects.
                error!(inst = %inst, detail = %detail, "balance event rejected");
                return;
            }
            Err(e) => {
                error!(code, error = %e, "balance event failed");
                return;
            }
        };

        match transition {
            BalanceTransition::Opened { quantity } => {
                info!(code, quantity, "buy settled, placing sell ladder");
                self.place_ladder_after_buy(code).await;
            }
            BalanceTransition::Pyramided { old_quantity, quantity } => {
                info!(
                    code,
                    old_quantity, quantity, "additional buy settled, rebuilding sell ladder"
                );
                self.rebuild_ladder(code).await;
            }
            BalanceTransition::Reduced { quantity, .. } => {
                let was_auto = self.auto_sell.lock().remove(code);
                let stoploss_active = self
                    .ctx
                    .positions
                    .get(code)
                    .map(|p| p.stoploss_triggered)
                    .unwrap_or(false);

                if stoploss_active {
                    // Partial stop-loss fill: the rest stays working at the
                    // same price; keep the ledger quantity honest.
                    self.ctx.ledger.update_stoploss_quantity(code, quantity);
                    debug!(code, remaining = quantity, "partial stop-loss fill");
                } else if was_auto {
                    debug!(code, remaining = quantity, "automatic sell settled, rungs unchanged");
                } else {
                    info!(code, remaining = quantity, "manual sell settled, recomputing ladder");
                    self.recompute_ladder_after_manual_sell(code).await;
                }
            }
            BalanceTransition::Closed { old_quantity } => {
                self.auto_sell.lock().remove(code);
                self.ctx.ledger.clear_for(code, None);
                info!(code, old_quantity, "position closed, ledger cleared");
            }
            BalanceTransition::Unchanged => {}
        }

        self.check_and_cancel_excess_orders().await;
    }

    // =========================================================================
    // Sell ladder
    // =========================================================================

    /// After a buy settles: place the ladder now if the session is open,
    /// otherwise leave the intentions in the ledger for session-open
    /// restoration.
    async fn place_ladder_after_buy(&self, code: &str) {
        let stoploss_active = self
            .ctx
            .positions
            .get(code)
            .map(|p| p.stoploss_triggered)
            .unwrap_or(false);
        if stoploss_active {
            return;
        }
        if let Err(e) = self.ensure_sell_orders(code).await {
            warn!(code, error = %e, "sell ladder placement failed");
        }
    }

    /// Pyramiding settled: the denominator changed, so the resting rungs are
    /// wrong. Cancel and re-place against the new quantity.
    async fn rebuild_ladder(&self, code: &str) {
        self.cancel_resting_sells(code).await;
        if let Err(e) = self.ensure_sell_orders(code).await {
            warn!(code, error = %e, "sell ladder rebuild failed");
        }
    }

    /// Manual partial sell: re-issue the automatic rungs with the remaining
    /// quantity as the new denominator, keeping the old denominator for
    /// audit.
    async fn recompute_ladder_after_manual_sell(&self, code: &str) {
        let Some(position) = self.ctx.positions.get(code) else {
            return;
        };
        if position.quantity <= 0 || position.stoploss_triggered {
            return;
        }
        if !self.ctx.is_trading_time() {
            info!(code, "manual-sell recompute deferred until the session opens");
            return;
        }

        self.cancel_resting_sells(code).await;
        self.ctx.positions.with_position(code, |p| {
            if p.initial_quantity != p.quantity {
                p.original_initial_quantity = p.initial_quantity;
                p.initial_quantity = p.quantity;
            }
        });
        if let Err(e) = self.ensure_sell_orders(code).await {
            warn!(code, error = %e, "ladder recompute failed");
        }
    }

    async fn cancel_resting_sells(&self, code: &str) {
        let account = match self.ctx.account() {
            Ok(a) => a,
            Err(_) => return,
        };
        let owned = code.to_string();
        match self
            .ctx
            .api
            .order(move |b| async move { b.cancel_sells_for_instrument(&account, &owned).await })
            .await
        {
            Ok(cancelled) if cancelled > 0 => {
                info!(code, cancelled, "resting sell orders cancelled");
            }
            Ok(_) => {}
            Err(e) => warn!(code, error = %e, "cancelling resting sells failed"),
        }
        self.ctx.ledger.clear_for(code, Some(OrderSide::Sell));
    }

    /// Make sure every eligible rung is intended (ledger) and, during the
    /// session, resting at the brokerage. Idempotent: rungs already in the
    /// ledger are skipped.
    pub async fn ensure_sell_orders(&self, code: &str) -> Result<(), TradingError> {
        let Some(position) = self.ctx.positions.get(code) else {
            return Ok(());
        };
        if position.quantity <= 0
            || position.avg_price <= 0
            || position.stoploss_triggered
            || position.frozen
        {
            return Ok(());
        }

        let buy_cfg = self.ctx.config.buy();
        let sell_cfg = self.ctx.config.sell();
        let candles = self.ctx.candles_for(code).await?;
        let ma = ta::ma_from_candles(&candles, buy_cfg.envelope_period);

        let rungs = SignalEngine::sell_ladder(
            &sell_cfg,
            position.avg_price,
            position.ladder_base(),
            position.quantity,
            ma,
            &position.sold_targets,
        );

        for rung in rungs {
            if self.ctx.ledger.has_target(code, rung.target) {
                continue;
            }
            let order = PendingOrder::sell(rung.quantity, rung.price, rung.target);
            if !self.ctx.is_trading_time() {
                // Store the intention; session-open restoration places it.
                self.ctx.ledger.save(code, order);
                info!(
                    code,
                    target = %rung.target,
                    qty = rung.quantity,
                    price = rung.price,
                    "session closed: rung deferred to the ledger"
                );
                continue;
            }

            match self.send_sell_with_retry(code, rung.quantity, rung.price).await {
                Ok(()) => {
                    self.ctx.ledger.save(code, order);
                    info!(
                        code,
                        target = %rung.target,
                        qty = rung.quantity,
                        price = rung.price,
                        "ladder rung placed"
                    );
                }
                Err(e) => {
                    warn!(code, target = %rung.target, error = %e, "rung placement failed");
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stop-loss
    // =========================================================================

    /// Fire the stop-loss: cancel everything resting for the instrument,
    /// then sell 100% of the quantity at the floored last price. The ledger
    /// entry persists so an unfilled stop is re-placed on the next day.
    pub async fn execute_stoploss(&self, code: &str, current_price: i64) {
        let Some(position) = self.ctx.positions.get(code) else {
            return;
        };
        if position.quantity <= 0 || position.stoploss_triggered {
            return;
        }

        let mut stop_price = SignalEngine::stoploss_price(current_price);
        if stop_price <= 0 {
            stop_price = (position.avg_price - ta::tick_size(position.avg_price)).max(1);
        }
        warn!(
            code,
            current_price,
            avg_price = position.avg_price,
            stop_price,
            qty = position.quantity,
            "stop-loss fired"
        );

        self.cancel_all_for(code).await;
        self.ctx.ledger.clear_for(code, Some(OrderSide::Buy));
        self.ctx.ledger.clear_for(code, Some(OrderSide::Sell));

        self.ctx.positions.set_stoploss(code, stop_price);
        self.ctx
            .ledger
            .save(code, PendingOrder::stoploss(position.quantity, stop_price));

        match self
            .send_sell_with_retry(code, position.quantity, stop_price)
            .await
        {
            Ok(()) => info!(code, qty = position.quantity, stop_price, "stop-loss order placed"),
            Err(e) => error!(code, error = %e, "stop-loss order failed"),
        }
    }

    /// Keep an armed stop-loss working: if the brokerage no longer shows a
    /// sell at the stop price (end-of-day purge, manual cancel), cancel the
    /// stragglers and re-place the full remaining quantity.
    pub async fn ensure_stoploss_order(&self, code: &str) {
        let Some(position) = self.ctx.positions.get(code) else {
            return;
        };
        if !position.stoploss_triggered
            || position.quantity <= 0
            || position.stoploss_price <= 0
            || !self.ctx.is_trading_time()
        {
            return;
        }

        let account = match self.ctx.account() {
            Ok(a) => a,
            Err(_) => return,
        };
        let open = match self
            .ctx
            .api
            .query(move |b| async move { b.open_orders(&account).await })
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                warn!(code, error = %e, "open-order check for stop-loss failed");
                return;
            }
        };

        let resting = open.iter().any(|o| {
            o.code == code && o.side == OrderSide::Sell && o.price == position.stoploss_price
        });
        if resting {
            return;
        }

        warn!(
            code,
            qty = position.quantity,
            price = position.stoploss_price,
            "armed stop-loss missing at broker, re-placing"
        );
        self.cancel_all_for(code).await;
        self.cancel_pending_buys(code).await;

        self.ctx.ledger.save(
            code,
            PendingOrder::stoploss(position.quantity, position.stoploss_price),
        );
        self.ctx
            .ledger
            .update_stoploss_quantity(code, position.quantity);

        match self
            .send_sell_with_retry(code, position.quantity, position.stoploss_price)
            .await
        {
            Ok(()) => info!(code, "stop-loss re-placed"),
            Err(e) => error!(code, error = %e, "stop-loss re-placement failed"),
        }
    }

    // =========================================================================
    // Buys
    // =========================================================================

    /// First-time entry: send the stage-1 limit, then pre-place the 2nd and
    /// 3rd staged buys as independent limits, recording all of them in the
    /// ledger.
    pub async fn execute_buy(&self, code: &str, signal: &BuySignal) {
        if let Some(p) = self.ctx.positions.get(code) {
            if p.stoploss_triggered || p.sell_occurred || p.frozen {
                warn!(code, "buy suppressed by position state");
                return;
            }
            if p.quantity == 0 && p.avg_price > 0 {
                warn!(code, "buy suppressed: instrument already traded today");
                return;
            }
            if p.quantity > 0 {
                return;
            }
        }
        if !self.ctx.is_trading_time() {
            debug!(code, "buy suppressed outside the session");
            return;
        }

        let name = self.ctx.names.display(code);
        info!(
            code,
            name = %name,
            limit = signal.limit_price,
            qty = signal.quantity,
            ma = signal.ma,
            trigger = signal.trigger_price,
            "first buy signal"
        );

        match self
            .send_buy_with_retry(code, signal.quantity, signal.limit_price)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                error!(code, error = %e, "first buy order failed");
                return;
            }
        }

        self.ctx
            .ledger
            .save(code, PendingOrder::buy(signal.quantity, signal.limit_price, 1));
        self.ctx
            .positions
            .record_first_buy_order(code, &name, signal.limit_price, signal.ma);

        // Staged buys go out immediately, one limit each.
        let buy_cfg = self.ctx.config.buy();
        for stage in SignalEngine::staged_buys(&buy_cfg, signal.limit_price, signal.tick) {
            match self.send_buy_once(code, stage.quantity, stage.price).await {
                Ok(()) => {
                    self.ctx.ledger.save(
                        code,
                        PendingOrder::buy(stage.quantity, stage.price, stage.buy_count),
                    );
                    info!(
                        code,
                        buy_count = stage.buy_count,
                        qty = stage.quantity,
                        price = stage.price,
                        "staged buy pre-placed"
                    );
                }
                Err(e) => {
                    warn!(code, buy_count = stage.buy_count, error = %e, "staged buy failed");
                }
            }
        }
    }

    /// Cancel unfilled buys at the brokerage and drop them from the ledger.
    pub async fn cancel_pending_buys(&self, code: &str) {
        if let Ok(account) = self.ctx.account() {
            let owned = code.to_string();
            match self
                .ctx
                .api
                .order(move |b| async move { b.cancel_buys_for_instrument(&account, &owned).await })
                .await
            {
                Ok(cancelled) if cancelled > 0 => {
                    info!(code, cancelled, "unfilled buys cancelled after sell");
                }
                Ok(_) => {}
                Err(e) => warn!(code, error = %e, "buy cancellation failed"),
            }
        }
        self.ctx.ledger.clear_for(code, Some(OrderSide::Buy));
    }

    async fn cancel_all_for(&self, code: &str) {
        let Ok(account) = self.ctx.account() else {
            return;
        };
        let owned = code.to_string();
        match self
            .ctx
            .api
            .order(move |b| async move { b.cancel_all_for_instrument(&account, &owned).await })
            .await
        {
            Ok(cancelled) if cancelled > 0 => info!(code, cancelled, "all resting orders cancelled"),
            Ok(_) => {}
            Err(e) => warn!(code, error = %e, "cancel-all failed"),
        }
    }

    /// Holder cap housekeeping: at capacity, unfilled buys for instruments
    /// we do not hold are withdrawn.
    pub async fn check_and_cancel_excess_orders(&self) {
        let max_holding = self.ctx.config.buy().max_holding_stocks;
        let holders = self.ctx.positions.holders();
        if holders.len() < max_holding {
            return;
        }
        let Ok(account) = self.ctx.account() else {
            return;
        };

        let held = holders.clone();
        match self
            .ctx
            .api
            .order(move |b| async move { b.cancel_buys_except_holdings(&account, &held).await })
            .await
        {
            Ok(cancelled) if cancelled > 0 => {
                warn!(
                    cancelled,
                    max_holding, "holder cap reached: non-holding buys cancelled"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "excess-order cancellation failed"),
        }

        for code in self.ctx.ledger.all().keys() {
            if !holders.contains(code) {
                self.ctx.ledger.clear_for(code, Some(OrderSide::Buy));
            }
        }
    }

    // =========================================================================
    // Order sending with retry
    // =========================================================================

    pub async fn send_buy_with_retry(
        &self,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        self.send_with_retry(OrderAction::Buy, code, quantity, price).await
    }

    pub async fn send_sell_with_retry(
        &self,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        self.send_with_retry(OrderAction::Sell, code, quantity, price).await
    }

    async fn send_buy_once(&self, code: &str, quantity: i64, price: i64) -> Result<(), TradingError> {
        let account = self.ctx.account()?;
        let request = OrderRequest::limit(OrderAction::Buy, &account, code, quantity, price);
        let status = self
            .ctx
            .api
            .order(move |b| async move { b.send_order(request).await })
            .await?;
        if status == 0 {
            Ok(())
        } else {
            Err(TradingError::OrderRejected(status))
        }
    }

    async fn send_with_retry(
        &self,
        action: OrderAction,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        let account = self.ctx.account()?;
        let eh = self.ctx.config.error_handling();
        let retries = eh.order_retry_count.max(1);
        let interval = Duration::from_millis(eh.order_retry_interval_ms);

        let mut last = TradingError::OrderRejected(-1);
        for attempt in 1..=retries {
            let request = OrderRequest::limit(action, &account, code, quantity, price);
            match self
                .ctx
                .api
                .order(move |b| async move { b.send_order(request).await })
                .await
            {
                Ok(0) => return Ok(()),
                Ok(status) => {
                    warn!(code, status, attempt, retries, "order rejected");
                    last = TradingError::OrderRejected(status);
                }
                Err(e) if e.is_retryable() => {
                    warn!(code, error = %e, attempt, retries, "order attempt failed");
                    last = e;
                }
                Err(e) => return Err(e),
            }
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }
        Err(last)
    }
}

// =============================================================================
// Tests — end-to-end over the paper broker
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{spawn_dispatcher_with_gaps, RateLimiter};
    use crate::broker::{BrokerAdapter, OrderStatus, PaperBroker};
    use crate::config_store::ConfigStore;
    use crate::market_data::Candle;
    use crate::market_hours::Clock;

    const CODE: &str = "005930";

    fn candles_ma_10000() -> Vec<Candle> {
        (0..25)
            .map(|i| Candle {
                date: format!("202507{:02}", 28 - i),
                open: 10_000,
                high: 10_100,
                low: 9_900,
                close: 10_000,
                volume: 1_000,
            })
            .collect()
    }

    async fn harness(clock: Clock) -> (Arc<TradingContext>, Arc<PaperBroker>, ExecutionHandler) {
        let broker = Arc::new(PaperBroker::new());
        let api = spawn_dispatcher_with_gaps(
            broker.clone(),
            Arc::new(RateLimiter::new(1_000, Duration::from_secs(1))),
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        let config = Arc::new(ConfigStore::in_memory());
        config.mutate(|d| d.error_handling.order_retry_interval_ms = 1);
        let ctx = Arc::new(TradingContext::new(
            config,
            broker.clone() as Arc<dyn BrokerAdapter>,
            api,
            clock,
        ));
        ctx.set_account("8000000011");
        ctx.candles.update(CODE, candles_ma_10000());
        broker.connect().await.unwrap();
        // Generous inventory so the simulator's sell-quantity guard never
        // interferes with injected balance scenarios.
        broker.seed_holding(CODE, 10_000, 8_050);
        let handler = ExecutionHandler::new(ctx.clone());
        (ctx, broker, handler)
    }

    fn sell_fill(price: i64, qty: i64) -> OrderEvent {
        OrderEvent {
            code: CODE.to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::Filled,
            order_quantity: qty,
            executed_quantity: qty,
            executed_price: price,
            order_no: format!("f{price}"),
        }
    }

    #[tokio::test]
    async fn ladder_placed_after_first_fill() {
        // Scenario: stage-1 buy of 124 @ 8,050 settles.
        let (ctx, broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;

        let sells = ctx.ledger.sell_entries(CODE);
        let got: Vec<(i64, i64)> = sells.iter().map(|e| (e.limit_price, e.quantity)).collect();
        assert_eq!(got, vec![(8_290, 37), (8_450, 37), (8_610, 37), (10_000, 13)]);
        assert_eq!(broker.open_order_count(), 4);

        // Idempotent: a second pass places nothing new.
        handler.ensure_sell_orders(CODE).await.unwrap();
        assert_eq!(ctx.ledger.sell_entries(CODE).len(), 4);
        assert_eq!(broker.open_order_count(), 4);
    }

    #[tokio::test]
    async fn ladder_deferred_outside_session() {
        let (ctx, broker, handler) = harness(Clock::fixed(17, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;

        // Intentions recorded, nothing sent.
        assert_eq!(ctx.ledger.sell_entries(CODE).len(), 4);
        assert_eq!(broker.open_order_count(), 0);
    }

    #[tokio::test]
    async fn auto_rung_fill_keeps_other_rungs() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;

        // Profit1 fills at its rung price.
        handler.on_order_event(&sell_fill(8_290, 37)).await;
        handler.on_balance_event(CODE, 87, 8_050).await;

        let p = ctx.positions.get(CODE).unwrap();
        assert!(p.has_sold(TargetName::Profit1));
        assert!(p.sell_occurred);
        // The remaining rungs stayed in the ledger untouched.
        let targets: Vec<TargetName> = ctx
            .ledger
            .sell_entries(CODE)
            .iter()
            .filter_map(|e| e.target_name)
            .collect();
        assert_eq!(
            targets,
            vec![
                TargetName::Profit2,
                TargetName::Profit3,
                TargetName::MovingAverage
            ]
        );
    }

    #[tokio::test]
    async fn manual_sell_recomputes_against_remainder() {
        // Scenario: 124 held, user sells 50 @ 8,100 manually.
        let (ctx, broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;

        // 8,100 matches no ledger rung: manual.
        handler.on_order_event(&sell_fill(8_100, 50)).await;
        handler.on_balance_event(CODE, 74, 8_050).await;

        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.initial_quantity, 74);
        assert_eq!(p.original_initial_quantity, 124);

        let qtys: Vec<i64> = ctx
            .ledger
            .sell_entries(CODE)
            .iter()
            .map(|e| e.quantity)
            .collect();
        assert_eq!(qtys, vec![22, 22, 22, 8]);
        assert_eq!(broker.open_order_count(), 4);
    }

    #[tokio::test]
    async fn stoploss_cancels_everything_and_persists() {
        // Scenario: Profit1 sold earlier, price falls back to the average.
        let (ctx, broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;
        handler.on_order_event(&sell_fill(8_290, 37)).await;
        handler.on_balance_event(CODE, 87, 8_050).await;

        handler.execute_stoploss(CODE, 8_000).await;

        let p = ctx.positions.get(CODE).unwrap();
        assert!(p.stoploss_triggered);
        assert_eq!(p.stoploss_price, 8_000);
        assert!(p.has_sold(TargetName::StopLoss));

        // Exactly one intended sell survives: the persisted stop.
        let sells = ctx.ledger.sell_entries(CODE);
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].target_name, Some(TargetName::StopLoss));
        assert_eq!(sells[0].quantity, 87);
        assert_eq!(sells[0].limit_price, 8_000);
        assert!(sells[0].persist);

        // Broker side: only the stop order is resting.
        let open = broker.open_orders("a").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].price, 8_000);
        assert_eq!(open[0].quantity, 87);
    }

    #[tokio::test]
    async fn partial_stoploss_fill_keeps_remainder_working() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;
        handler.on_order_event(&sell_fill(8_290, 37)).await;
        handler.on_balance_event(CODE, 87, 8_050).await;
        handler.execute_stoploss(CODE, 8_000).await;

        // 40 of 87 fill; the balance drops but the stop stays armed.
        handler.on_order_event(&sell_fill(8_000, 40)).await;
        handler.on_balance_event(CODE, 47, 8_050).await;

        let p = ctx.positions.get(CODE).unwrap();
        assert!(p.stoploss_triggered);
        let sells = ctx.ledger.sell_entries(CODE);
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].quantity, 47);
        assert_eq!(sells[0].limit_price, 8_000);
    }

    #[tokio::test]
    async fn full_close_clears_ledger_but_blocks_reentry() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;
        handler.on_order_event(&sell_fill(8_290, 37)).await;
        handler.on_balance_event(CODE, 87, 8_050).await;
        handler.execute_stoploss(CODE, 8_000).await;

        handler.on_order_event(&sell_fill(8_000, 87)).await;
        handler.on_balance_event(CODE, 0, 0).await;

        assert!(ctx.ledger.orders_for(CODE).is_empty());
        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.quantity, 0);
        assert!(p.sold_targets.is_empty());
        assert!(!p.stoploss_triggered);
        assert!(p.sell_occurred, "same-day re-entry stays blocked");
    }

    #[tokio::test]
    async fn first_buy_places_three_stage_ladder() {
        let (ctx, broker, handler) = harness(Clock::fixed(10, 0)).await;
        let buy_cfg = ctx.config.buy();
        let signal = SignalEngine::check_buy_signal(
            &buy_cfg,
            CODE,
            8_100,
            &candles_ma_10000(),
            None,
            0,
        )
        .unwrap();

        handler.execute_buy(CODE, &signal).await;

        let buys: Vec<(i64, i64, Option<u32>)> = ctx
            .ledger
            .orders_for(CODE)
            .iter()
            .filter(|e| e.side == OrderSide::Buy)
            .map(|e| (e.limit_price, e.quantity, e.buy_count))
            .collect();
        assert_eq!(
            buys,
            vec![
                (8_050, 124, Some(1)),
                (7_250, 137, Some(2)),
                (6_550, 152, Some(3)),
            ]
        );
        assert_eq!(broker.open_order_count(), 3);
        // Placeholder position recorded for the fill to land on.
        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.first_buy_price, 8_050);
        assert_eq!(p.quantity, 0);
    }

    #[tokio::test]
    async fn buy_fill_learns_stage_from_ledger() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        ctx.ledger.save(CODE, PendingOrder::buy(137, 7_250, 2));
        ctx.positions.record_first_buy_order(CODE, "테스트", 8_050, 10_000);
        ctx.positions.with_position(CODE, |p| {
            p.quantity = 124;
            p.avg_price = 8_050;
            p.initial_quantity = 124;
        });

        handler
            .on_order_event(&OrderEvent {
                code: CODE.to_string(),
                side: OrderSide::Buy,
                status: OrderStatus::Filled,
                order_quantity: 137,
                executed_quantity: 137,
                executed_price: 7_250,
                order_no: "b2".into(),
            })
            .await;

        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.buy_count, 2);
        assert_eq!(p.last_executed_price, 7_250);
        // The filled entry left the ledger.
        assert!(ctx.ledger.find_at_price(CODE, OrderSide::Buy, 7_250).is_none());
    }

    #[tokio::test]
    async fn pyramid_fill_rebuilds_ladder_with_new_denominator() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        handler.on_balance_event(CODE, 124, 8_050).await;
        // Stage 2 settles: 124 + 137 = 261 @ avg 7,630.
        handler.on_balance_event(CODE, 261, 7_630).await;

        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.buy_count, 2);
        assert_eq!(p.initial_quantity, 261);

        let sells = ctx.ledger.sell_entries(CODE);
        let qtys: Vec<i64> = sells.iter().map(|e| e.quantity).collect();
        // floor(261 * 0.3) = 78 per profit rung, remainder 27 on the MA rung.
        assert_eq!(qtys, vec![78, 78, 78, 27]);
        // Prices follow the new average.
        assert_eq!(sells[0].limit_price, ta::ceil_to_tick(7_630.0 * 1.0295));
    }

    #[tokio::test]
    async fn running_average_across_partial_buy_fills() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        ctx.positions.record_first_buy_order(CODE, "테스트", 8_050, 10_000);

        for (qty, price) in [(60, 8_050), (64, 8_040)] {
            handler
                .on_order_event(&OrderEvent {
                    code: CODE.to_string(),
                    side: OrderSide::Buy,
                    status: OrderStatus::PartiallyFilled,
                    order_quantity: 124,
                    executed_quantity: qty,
                    executed_price: price,
                    order_no: format!("b{price}"),
                })
                .await;
        }

        let p = ctx.positions.get(CODE).unwrap();
        assert_eq!(p.last_executed_qty, 124);
        // (60*8050 + 64*8040) / 124 = 8044.8… truncated.
        assert_eq!(p.last_executed_price, (60 * 8_050 + 64 * 8_040) / 124);
    }

    #[tokio::test]
    async fn execution_audit_dedups_by_order_no() {
        let (ctx, _broker, handler) = harness(Clock::fixed(10, 0)).await;
        let ev = sell_fill(8_290, 37);
        handler.on_order_event(&ev).await;
        handler.on_order_event(&ev).await;
        assert_eq!(ctx.config.executions_for(CODE, None).len(), 1);
    }
}

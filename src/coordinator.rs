// =============================================================================
// TradingCoordinator — lifecycle, pipelines, and crash recovery
// =============================================================================
//
// Owns the engine's moving parts:
//
//   startup    full state sync: balance refresh, execution-log heuristics,
//              ledger housekeeping, stop-loss/ladder/pending-order
//              restoration (when the session is open).
//   pipeline   realtime tick → debounce → tick queue → signal worker →
//              intent queue → 100 ms drain (one intent per tick, 350 ms
//              minimum between order submissions).
//   polling    every 30 s, the top unsubscribed watchlist instruments go
//              through the same decision path on cached candles.
//   watcher    every 60 s: day rollover, session-open restoration, and
//              re-restoration when the broker reports zero open orders
//              while the ledger still has intentions.
//   refresher  background candle rotation through the TR queue.
//   shutdown   stop flag, slot unsubscription, state flush.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerEvent, OrderAction, OrderRequest, SubscribeMode};
use crate::config_store::ExecutionRecord;
use crate::context::TradingContext;
use crate::errors::TradingError;
use crate::execution_handler::ExecutionHandler;
use crate::market_data::{Tick, CANDLE_FETCH_COUNT};
use crate::market_hours;
use crate::order_ledger::PendingOrder;
use crate::signal_engine::{Intent, SignalEngine};
use crate::types::{OrderSide, PriceKind, TargetName};

/// Drain cadence for the intent queue.
const INTENT_DRAIN_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum spacing between order-submitting intents.
const ORDER_MIN_INTERVAL: Duration = Duration::from_millis(350);
/// Capacity of the intent queue between worker and drain.
const INTENT_QUEUE_CAPACITY: usize = 1_024;
/// Signal-worker pop timeout (its shutdown check cadence).
const TICK_POP_TIMEOUT: Duration = Duration::from_millis(500);
/// Spacing of candle fetches inside a refresh batch.
const BATCH_STOCK_INTERVAL: Duration = Duration::from_millis(350);
/// Batch refresh cadence.
const BATCH_INTERVAL: Duration = Duration::from_secs(3);
/// Polling rotation cadence and fan-out.
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const POLL_BATCH: usize = 5;
/// Market-open watcher cadence.
const WATCHER_INTERVAL: Duration = Duration::from_secs(60);

pub struct TradingCoordinator {
    ctx: Arc<TradingContext>,
    handler: Arc<ExecutionHandler>,
}

impl TradingCoordinator {
    pub fn new(ctx: Arc<TradingContext>) -> Self {
        let handler = Arc::new(ExecutionHandler::new(ctx.clone()));
        Self { ctx, handler }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect, sync state, wire subscriptions, and spawn every background
    /// loop. Returns once the engine is running.
    pub async fn start(
        self: Arc<Self>,
        events: mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> anyhow::Result<()> {
        let connected = self
            .ctx
            .api
            .query(|b| async move { b.connect().await })
            .await?;
        if !connected {
            anyhow::bail!("brokerage session refused the connection");
        }
        info!(server = %self.ctx.broker.server_kind(), "brokerage session opened");

        // Account: configured one wins, else the first the session offers.
        let account = match self.ctx.config.account_number() {
            Some(acc) => acc,
            None => {
                let accounts = self
                    .ctx
                    .api
                    .query(|b| async move { b.accounts().await })
                    .await?;
                accounts
                    .first()
                    .cloned()
                    .ok_or(TradingError::NoAccount)?
            }
        };
        self.ctx.set_account(&account);
        info!(account = %account, "trading account selected");

        self.startup_sync().await;
        self.refresh_subscriptions().await;

        // Pipeline channels.
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_QUEUE_CAPACITY);

        tokio::spawn(Self::event_loop(self.clone(), events));
        tokio::spawn(Self::signal_worker(self.clone(), intent_tx.clone()));
        tokio::spawn(Self::intent_drain(self.clone(), intent_tx.clone(), intent_rx));
        tokio::spawn(Self::batch_refresher(self.clone()));
        tokio::spawn(Self::polling_loop(self.clone(), intent_tx));
        tokio::spawn(Self::market_open_watcher(self.clone()));

        self.ctx
            .config
            .update_session(&market_hours::today_string(), true);
        info!("trading coordinator running");
        Ok(())
    }

    /// Stop every loop, release the realtime slots, and flush state.
    pub async fn stop(&self) {
        info!("stopping trading coordinator");
        self.ctx.signal_stop();

        for screen in crate::market_data::SLOT_SCREENS {
            let result = self
                .ctx
                .api
                .query(move |b| async move { b.unsubscribe_realtime(screen, None).await })
                .await;
            if let Err(e) = result {
                warn!(screen, error = %e, "slot unsubscription failed");
            }
        }

        self.ctx
            .config
            .update_session(&market_hours::today_string(), false);
        if let Err(e) = self.ctx.config.flush() {
            error!(error = %e, "state flush on shutdown failed");
        }
        info!("trading coordinator stopped");
    }

    // =========================================================================
    // Startup sync
    // =========================================================================

    pub async fn startup_sync(&self) {
        info!("startup state sync begins");

        let today = market_hours::today_string();
        if self.ctx.config.last_trading_date() != today {
            self.ctx.config.reset_session_for_new_day(&today);
            self.ctx.positions.rollover_new_day();
        }
        self.ctx.positions.clear_frozen_all();

        if let Err(e) = self.sync_positions_from_account().await {
            error!(error = %e, "balance sync failed");
        }
        if let Err(e) = self.sync_state_from_executions().await {
            error!(error = %e, "execution-log sync failed");
        }

        self.housekeep_ledger();
        self.ctx.config.clear_old_executions(7);

        if self.ctx.is_trading_time() {
            self.ensure_all_stoploss_orders().await;
            self.restore_all_sell_ladders().await;
            self.check_and_restore_orders().await;
        } else {
            info!("session closed: order restoration deferred to the open watcher");
        }

        info!("startup state sync complete");
    }

    async fn sync_positions_from_account(&self) -> Result<(), TradingError> {
        let account = self.ctx.account()?;
        let acc = account.clone();
        let balance = self
            .ctx
            .api
            .query(move |b| async move { b.balance(&acc).await })
            .await?;

        for h in &balance.holdings {
            self.ctx.names.insert(&h.code, &h.name);
        }
        self.ctx.positions.sync_from_holdings(&balance.holdings);
        let held: HashSet<String> = balance.holdings.iter().map(|h| h.code.clone()).collect();
        self.ctx.positions.cleanup_missing(&held);

        let acc = account.clone();
        match self
            .ctx
            .api
            .query(move |b| async move { b.deposit_detail(&acc).await })
            .await
        {
            Ok(d) => info!(
                deposit = d.deposit,
                available = d.available,
                order_available = d.order_available,
                "account snapshot"
            ),
            Err(e) => warn!(error = %e, "deposit detail unavailable"),
        }
        Ok(())
    }

    /// Rebuild today's sticky flags from the broker's execution log after a
    /// restart: which rungs plausibly sold, whether buys happened.
    async fn sync_state_from_executions(&self) -> Result<(), TradingError> {
        if self.ctx.config.is_state_synced() {
            debug!("state already synced today");
            return Ok(());
        }
        let account = self.ctx.account()?;
        let executions = self
            .ctx
            .api
            .query(move |b| async move { b.today_executions(&account).await })
            .await?;
        info!(count = executions.len(), "today's executions fetched");

        let today = market_hours::today_string();
        let buy_cfg = self.ctx.config.buy();
        let sell_cfg = self.ctx.config.sell();

        let mut touched: HashSet<String> = HashSet::new();
        for e in &executions {
            self.ctx.config.save_execution(
                &e.code,
                ExecutionRecord {
                    side: e.side,
                    quantity: e.quantity,
                    price: e.price,
                    time: e.time.clone(),
                    order_no: e.order_no.clone(),
                },
                Some(&today),
            );
            touched.insert(e.code.clone());
        }

        for code in touched {
            let Some(position) = self.ctx.positions.get(&code) else {
                continue;
            };
            let fills: Vec<_> = executions.iter().filter(|e| e.code == code).collect();
            let buys = fills.iter().filter(|e| e.side == OrderSide::Buy).count() as u32;
            let sells: Vec<_> = fills
                .iter()
                .filter(|e| e.side == OrderSide::Sell)
                .collect();

            if buys > position.buy_count {
                let capped = buys.min(buy_cfg.max_buy_count);
                self.ctx.positions.with_position(&code, |p| {
                    p.buy_count = capped;
                });
                info!(code = %code, buy_count = capped, "buy stage recovered from executions");
            }

            if !sells.is_empty() && position.avg_price > 0 {
                for sell in &sells {
                    let profit_rate = (sell.price - position.avg_price) as f64
                        / position.avg_price as f64
                        * 100.0;

                    let mut matched = false;
                    for (i, target) in TargetName::PROFIT_RUNGS.iter().enumerate() {
                        let rate = sell_cfg.profit_targets.get(i).copied().unwrap_or(0.0);
                        if (profit_rate - rate).abs() <= 0.5 {
                            if self.ctx.positions.mark_sold_target(&code, *target) {
                                info!(code = %code, %target, profit_rate, "sold rung recovered");
                            }
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        let first_target =
                            sell_cfg.profit_targets.first().copied().unwrap_or(0.0);
                        if profit_rate > 0.0 && profit_rate < first_target {
                            if self
                                .ctx
                                .positions
                                .mark_sold_target(&code, TargetName::MovingAverage)
                            {
                                info!(code = %code, profit_rate, "MA rung recovered");
                            }
                        } else if profit_rate < 0.0
                            && self
                                .ctx
                                .positions
                                .mark_sold_target(&code, TargetName::StopLoss)
                        {
                            info!(code = %code, profit_rate, "stop-loss fill recovered");
                        }
                    }
                }
                // A sell happened: staged buys must not come back.
                self.handler.cancel_pending_buys(&code).await;
            }
        }

        self.ctx.config.set_state_synced(true);
        Ok(())
    }

    /// Drop ledger entries that no longer make sense: everything for closed
    /// positions, buys for instruments that already sold. Persisted entries
    /// survive unless their position is gone.
    fn housekeep_ledger(&self) {
        for (code, _) in self.ctx.ledger.all() {
            let position = self.ctx.positions.get(&code);
            let quantity = position.as_ref().map(|p| p.quantity).unwrap_or(0);
            if quantity == 0 {
                self.ctx.ledger.clear_for(&code, None);
                debug!(code = %code, "stale ledger entries dropped (no position)");
                continue;
            }
            if position.map(|p| p.sell_occurred).unwrap_or(false) {
                self.ctx
                    .ledger
                    .retain_for(&code, |e| e.side == OrderSide::Sell);
            }
        }
    }

    // =========================================================================
    // Restoration
    // =========================================================================

    pub async fn ensure_all_stoploss_orders(&self) {
        for (code, p) in self.ctx.positions.snapshot() {
            if p.stoploss_triggered && p.quantity > 0 {
                self.handler.ensure_stoploss_order(&code).await;
            }
        }
    }

    pub async fn restore_all_sell_ladders(&self) {
        if !self.ctx.is_trading_time() {
            return;
        }
        for (code, p) in self.ctx.positions.snapshot() {
            if p.quantity > 0 && !p.stoploss_triggered && !p.frozen {
                if let Err(e) = self.handler.ensure_sell_orders(&code).await {
                    warn!(code = %code, error = %e, "ladder restoration failed");
                }
            }
        }
    }

    /// Replay the ledger against the brokerage: place every intended order
    /// that is not already resting, skipping the ones whose preconditions
    /// have evaporated.
    pub async fn check_and_restore_orders(&self) {
        if !self.ctx.is_trading_time() {
            info!("order restoration waiting for the session");
            return;
        }
        let Ok(account) = self.ctx.account() else {
            warn!("order restoration impossible without an account");
            return;
        };

        let today = market_hours::today_string();
        if self.ctx.config.last_trading_date() != today {
            self.ctx.config.reset_session_for_new_day(&today);
            self.ctx.positions.rollover_new_day();
        }

        if self.ctx.config.is_orders_restored() {
            self.ensure_all_stoploss_orders().await;
            debug!("orders already restored today");
            return;
        }

        let pending = self.ctx.ledger.all();
        if pending.is_empty() {
            info!("nothing to restore");
            self.ensure_all_stoploss_orders().await;
            self.ctx.config.set_orders_restored(true);
            return;
        }

        let acc = account.clone();
        let open = match self
            .ctx
            .api
            .query(move |b| async move { b.open_orders(&acc).await })
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "open-order fetch failed, restoration postponed");
                return;
            }
        };
        let resting: HashSet<(String, OrderSide, i64)> = open
            .iter()
            .map(|o| (o.code.clone(), o.side, o.price))
            .collect();

        let max_holding = self.ctx.config.buy().max_holding_stocks;
        let mut restored = 0u32;
        let mut skipped = 0u32;
        let mut duplicate = 0u32;

        for (code, orders) in pending {
            let position = self.ctx.positions.get(&code);
            // Sells already resting at the broker count against the holding.
            let mut sell_committed: i64 = open
                .iter()
                .filter(|o| o.code == code && o.side == OrderSide::Sell)
                .map(|o| o.unfilled_qty)
                .sum();
            for order in orders {
                let key = (code.clone(), order.side, order.limit_price);
                if resting.contains(&key) {
                    duplicate += 1;
                    self.ctx.ledger.remove_matching(
                        &code,
                        order.side,
                        Some(order.limit_price),
                        None,
                    );
                    continue;
                }

                match order.side {
                    OrderSide::Buy => {
                        let sell_occurred =
                            position.as_ref().map(|p| p.sell_occurred).unwrap_or(false);
                        if sell_occurred {
                            skipped += 1;
                            self.ctx.ledger.remove_matching(
                                &code,
                                OrderSide::Buy,
                                Some(order.limit_price),
                                None,
                            );
                            continue;
                        }
                        let fresh_entry =
                            position.as_ref().map(|p| p.quantity == 0).unwrap_or(true);
                        if fresh_entry && self.ctx.positions.holder_count() >= max_holding {
                            skipped += 1;
                            self.ctx.ledger.remove_matching(
                                &code,
                                OrderSide::Buy,
                                Some(order.limit_price),
                                None,
                            );
                            continue;
                        }
                        match self
                            .send_once(OrderAction::Buy, &code, order.quantity, order.limit_price)
                            .await
                        {
                            Ok(()) => {
                                restored += 1;
                                info!(
                                    code = %code,
                                    buy_count = ?order.buy_count,
                                    qty = order.quantity,
                                    price = order.limit_price,
                                    "buy order restored"
                                );
                            }
                            Err(e) => warn!(code = %code, error = %e, "buy restoration failed"),
                        }
                    }
                    OrderSide::Sell => {
                        let held = position.as_ref().map(|p| p.quantity).unwrap_or(0);
                        // Never commit more than the holding across all
                        // restored sells for this instrument.
                        let quantity = order.quantity.min(held - sell_committed);
                        if quantity <= 0 {
                            skipped += 1;
                            self.ctx.ledger.remove_matching(
                                &code,
                                OrderSide::Sell,
                                Some(order.limit_price),
                                None,
                            );
                            continue;
                        }
                        sell_committed += quantity;
                        match self
                            .send_once(OrderAction::Sell, &code, quantity, order.limit_price)
                            .await
                        {
                            Ok(()) => {
                                restored += 1;
                                info!(
                                    code = %code,
                                    target = ?order.target_name,
                                    qty = quantity,
                                    price = order.limit_price,
                                    "sell order restored"
                                );
                            }
                            Err(e) => warn!(code = %code, error = %e, "sell restoration failed"),
                        }
                    }
                }
            }
        }

        self.ensure_all_stoploss_orders().await;
        self.restore_all_sell_ladders().await;

        info!(restored, skipped, duplicate, "order restoration finished");
        self.ctx.config.set_orders_restored(true);
    }

    async fn send_once(
        &self,
        action: OrderAction,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        let account = self.ctx.account()?;
        let request = OrderRequest::limit(action, &account, code, quantity, price);
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

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Re-run the allocator and apply the diffs. Called at startup and
    /// whenever the watchlist or holdings change.
    pub async fn refresh_subscriptions(&self) {
        let watchlist = self.ctx.config.watchlist_codes();
        let holders = self.ctx.positions.holders();

        let plan = {
            let mut alloc = self.ctx.allocator.lock();
            alloc.set_priority(holders);
            alloc.plan(&watchlist)
        };

        for (slot, screen) in crate::market_data::SLOT_SCREENS.iter().enumerate() {
            for code in &plan.unregister[slot] {
                let code = code.clone();
                let screen = *screen;
                let result = self
                    .ctx
                    .api
                    .query(move |b| async move {
                        b.unsubscribe_realtime(screen, Some(&code)).await
                    })
                    .await;
                if let Err(e) = result {
                    warn!(screen, error = %e, "unsubscribe failed");
                }
            }
            if !plan.register[slot].is_empty() {
                let codes = plan.register[slot].clone();
                let screen = *screen;
                let count = codes.len();
                let result = self
                    .ctx
                    .api
                    .query(move |b| async move {
                        b.subscribe_realtime(screen, &codes, SubscribeMode::Append).await
                    })
                    .await;
                match result {
                    Ok(()) => info!(screen, count, "realtime slot updated"),
                    Err(e) => warn!(screen, error = %e, "subscribe failed"),
                }
            }
        }
        if !plan.polling.is_empty() {
            info!(count = plan.polling.len(), "watchlist overflow on polling rotation");
        }

        self.ctx.scheduler.set_stocks(watchlist);
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        let mut stop = self.ctx.stop_rx();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                maybe = events.recv() => {
                    let Some(event) = maybe else { break };
                    Self::dispatch_event(&self, event).await;
                }
            }
        }
        debug!("event loop stopped");
    }

    async fn dispatch_event(this: &Arc<Self>, event: BrokerEvent) {
        match event {
            BrokerEvent::RealtimePrice { code, price, .. } => {
                if this.ctx.debouncer.should_process(&code, price) {
                    this.ctx.tick_queue.push(Tick { code, price });
                }
            }
            BrokerEvent::Order(ev) => this.handler.on_order_event(&ev).await,
            BrokerEvent::Balance {
                code,
                quantity,
                avg_price,
            } => {
                this.handler.on_balance_event(&code, quantity, avg_price).await;
                // Holdings changed: holders get subscription priority.
                this.refresh_subscriptions().await;
            }
            BrokerEvent::Message {
                screen,
                rq_name,
                tr_code,
                msg,
            } => {
                info!(screen = %screen, rq = %rq_name, tr = %tr_code, msg = %msg, "broker message");
            }
            BrokerEvent::Disconnected => {
                warn!("brokerage session lost, decision loop halted");
                tokio::spawn(Self::reconnect_loop(this.clone()));
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let interval =
            Duration::from_secs(self.ctx.config.error_handling().reconnect_interval_sec.max(1));
        let mut stop = self.ctx.stop_rx();
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.ctx.api.query(|b| async move { b.connect().await }).await {
                Ok(true) => {
                    info!("brokerage session re-opened");
                    // Broker-side orders may have died with the session.
                    self.ctx.config.set_orders_restored(false);
                    self.check_and_restore_orders().await;
                    return;
                }
                Ok(false) | Err(_) => {
                    warn!(retry_in = ?interval, "reconnect attempt failed");
                }
            }
        }
    }

    /// Pull debounced ticks, evaluate on cached candles only, and push the
    /// resulting intents. Never touches the wire.
    async fn signal_worker(self: Arc<Self>, intents: mpsc::Sender<Intent>) {
        let stop = self.ctx.stop_rx();
        loop {
            if *stop.borrow() {
                break;
            }
            let Some(tick) = self.ctx.tick_queue.pop_timeout(TICK_POP_TIMEOUT).await else {
                continue;
            };
            if !self.ctx.broker.is_connected() || !self.ctx.is_market_open() {
                continue;
            }
            let Some(candles) = self.ctx.candles.get_fresh(&tick.code) else {
                continue;
            };

            let buy_cfg = self.ctx.config.buy();
            let position = self.ctx.positions.get(&tick.code);
            let holder_count = self.ctx.positions.holder_count();
            for intent in SignalEngine::evaluate(
                &buy_cfg,
                &tick.code,
                tick.price,
                &candles,
                position.as_ref(),
                holder_count,
            ) {
                if intents.try_send(intent).is_err() {
                    warn!(code = %tick.code, "intent queue full, decision dropped");
                    break;
                }
            }
        }
        debug!("signal worker stopped");
    }

    /// Drain at most one intent per 100 ms tick, spacing order submissions
    /// at least 350 ms apart; a throttled intent goes back to the queue.
    async fn intent_drain(
        self: Arc<Self>,
        requeue: mpsc::Sender<Intent>,
        mut intents: mpsc::Receiver<Intent>,
    ) {
        let stop = self.ctx.stop_rx();
        let mut interval = tokio::time::interval(INTENT_DRAIN_INTERVAL);
        let mut last_order = Instant::now() - ORDER_MIN_INTERVAL;
        loop {
            interval.tick().await;
            if *stop.borrow() {
                break;
            }
            let Ok(intent) = intents.try_recv() else {
                continue;
            };
            if last_order.elapsed() < ORDER_MIN_INTERVAL {
                let _ = requeue.try_send(intent);
                continue;
            }
            self.dispatch_intent(&intent).await;
            last_order = Instant::now();
        }
        debug!("intent drain stopped");
    }

    pub async fn dispatch_intent(&self, intent: &Intent) {
        debug!(kind = intent.kind(), code = intent.code(), "dispatching intent");
        match intent {
            Intent::EnsureStoploss { code } => self.handler.ensure_stoploss_order(code).await,
            Intent::Stoploss { code, price } => self.handler.execute_stoploss(code, *price).await,
            Intent::EnsureSellLadder { code } => {
                if let Err(e) = self.handler.ensure_sell_orders(code).await {
                    warn!(code = %code, error = %e, "ladder upkeep failed");
                }
            }
            Intent::Buy { code, signal, .. } => {
                // In-flight dedup: an entry already working in the ledger
                // means this signal fired again before the fill.
                let already_working = self
                    .ctx
                    .ledger
                    .orders_for(code)
                    .iter()
                    .any(|e| e.side == OrderSide::Buy);
                if already_working {
                    debug!(code = %code, "buy intent dropped, entry already working");
                    return;
                }
                self.handler.execute_buy(code, signal).await;
            }
        }
    }

    /// Round-robin candle refresh through the TR queue.
    async fn batch_refresher(self: Arc<Self>) {
        let stop = self.ctx.stop_rx();
        let mut interval = tokio::time::interval(BATCH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if *stop.borrow() {
                break;
            }
            if !self.ctx.broker.is_connected() {
                continue;
            }
            for code in self.ctx.scheduler.next_batch() {
                if *stop.borrow() {
                    break;
                }
                let owned = code.clone();
                match self
                    .ctx
                    .api
                    .query(move |b| async move {
                        b.daily_candles(&owned, CANDLE_FETCH_COUNT).await
                    })
                    .await
                {
                    Ok(candles) if !candles.is_empty() => {
                        self.ctx.candles.update(&code, candles);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(code = %code, error = %e, "candle refresh failed"),
                }
                tokio::time::sleep(BATCH_STOCK_INTERVAL).await;
            }
        }
        debug!("batch refresher stopped");
    }

    /// Instruments outside the realtime slots go through the decision path
    /// on a slow rotation, using cached candles.
    async fn polling_loop(self: Arc<Self>, intents: mpsc::Sender<Intent>) {
        let stop = self.ctx.stop_rx();
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if *stop.borrow() {
                break;
            }
            if !self.ctx.broker.is_connected() || !self.ctx.is_market_open() {
                continue;
            }

            let watchlist = self.ctx.config.watchlist_codes();
            let unsubscribed = {
                let alloc = self.ctx.allocator.lock();
                alloc.unregistered_of(&watchlist)
            };

            for code in unsubscribed.into_iter().take(POLL_BATCH) {
                if *stop.borrow() {
                    break;
                }
                let candles = match self.ctx.candles_for(&code).await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(code = %code, error = %e, "polling skipped, no candles");
                        continue;
                    }
                };
                let Some(price) = candles.first().map(|c| c.close).filter(|&p| p > 0) else {
                    continue;
                };

                let buy_cfg = self.ctx.config.buy();
                let position = self.ctx.positions.get(&code);
                let holder_count = self.ctx.positions.holder_count();
                for intent in SignalEngine::evaluate(
                    &buy_cfg,
                    &code,
                    price,
                    &candles,
                    position.as_ref(),
                    holder_count,
                ) {
                    let _ = intents.try_send(intent);
                }
            }
        }
        debug!("polling loop stopped");
    }

    /// Once a minute: handle day rollover, run restoration when the session
    /// opens, and re-restore when the broker dropped our orders (end-of-day
    /// purges show up as zero open orders against a non-empty ledger).
    async fn market_open_watcher(self: Arc<Self>) {
        let stop = self.ctx.stop_rx();
        let mut interval = tokio::time::interval(WATCHER_INTERVAL);
        loop {
            interval.tick().await;
            if *stop.borrow() {
                break;
            }
            self.market_open_tick().await;
        }
        debug!("market-open watcher stopped");
    }

    pub async fn market_open_tick(&self) {
        self.log_position_summaries();

        let today = market_hours::today_string();
        if self.ctx.config.last_trading_date() != today {
            self.ctx.config.reset_session_for_new_day(&today);
            self.ctx.positions.rollover_new_day();
        }

        if !self.ctx.is_trading_time() || !self.ctx.broker.is_connected() {
            return;
        }

        if self.ctx.config.is_orders_restored() {
            // Already restored: only intervene if the broker shows nothing
            // resting while we still intend orders.
            if self.ctx.ledger.is_empty() {
                return;
            }
            let Ok(account) = self.ctx.account() else {
                return;
            };
            match self
                .ctx
                .api
                .query(move |b| async move { b.open_orders(&account).await })
                .await
            {
                Ok(open) if open.is_empty() => {
                    warn!("broker reports no open orders but the ledger is non-empty: re-restoring");
                    self.ctx.config.set_orders_restored(false);
                }
                Ok(_) => return,
                Err(e) => {
                    warn!(error = %e, "open-order probe failed");
                    return;
                }
            }
        }

        self.check_and_restore_orders().await;
    }

    /// Holdings overview for the log surface, priced off the freshest
    /// debounced tick.
    fn log_position_summaries(&self) {
        let buy_cfg = self.ctx.config.buy();
        for (code, position) in self.ctx.positions.snapshot() {
            if position.quantity <= 0 {
                continue;
            }
            let Some(price) = self.ctx.debouncer.latest(&code) else {
                continue;
            };
            let Some(candles) = self.ctx.candles.get_fresh(&code) else {
                continue;
            };
            if let Some(s) =
                SignalEngine::position_summary(&buy_cfg, &position, price, &candles)
            {
                info!(
                    code = %s.code,
                    qty = s.quantity,
                    avg = s.avg_price,
                    price = s.current_price,
                    profit_pct = s.profit_rate_pct,
                    ma = ?s.ma,
                    sold = s.sold_targets.len(),
                    "position summary"
                );
            }
        }
    }

    // =========================================================================
    // Manual orders
    // =========================================================================

    pub async fn manual_buy(
        &self,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        self.manual_order(OrderAction::Buy, code, quantity, price).await
    }

    pub async fn manual_sell(
        &self,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        self.manual_order(OrderAction::Sell, code, quantity, price).await
    }

    /// Manual orders bypass the signal path but respect session hours and
    /// connection state. `price == 0` means market.
    async fn manual_order(
        &self,
        action: OrderAction,
        code: &str,
        quantity: i64,
        price: i64,
    ) -> Result<(), TradingError> {
        if !self.ctx.broker.is_connected() {
            return Err(TradingError::NotConnected);
        }
        if !self.ctx.is_trading_time() {
            return Err(TradingError::MarketClosed);
        }
        let account = self.ctx.account()?;
        let request = OrderRequest {
            action,
            account,
            code: code.to_string(),
            quantity,
            price,
            price_kind: if price == 0 {
                PriceKind::Market
            } else {
                PriceKind::Limit
            },
            original_order_no: None,
        };
        let status = self
            .ctx
            .api
            .order(move |b| async move { b.send_order(request).await })
            .await?;
        if status == 0 {
            info!(code, ?action, quantity, price, "manual order accepted");
            Ok(())
        } else {
            Err(TradingError::OrderRejected(status))
        }
    }
}

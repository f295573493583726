// =============================================================================
// PositionStore — per-instrument position state machine
// =============================================================================
//
// Life-cycle per instrument (driven by authoritative balance events):
//
//   Empty ──first balance qty>0──▶ Open(buy_count=1)
//   Open  ──balance qty↑────────▶ Open(buy_count+1)      (pyramiding)
//   Open  ──any sell fill───────▶ Open(sell_occurred)    (buys frozen)
//   Open  ──tick ≤ avg, sold≠∅──▶ StopLossActive
//   *     ──balance qty==0──────▶ Closed(sell_occurred)  (re-entry blocked)
//   Closed──day rollover────────▶ Empty
//
// Rules enforced here:
//   - sold_targets only grows during a position's lifetime.
//   - once sell_occurred, a quantity increase is an illegal transition — it
//     is logged, the instrument is frozen, and no side-effects run (the
//     broker's quantity is still recorded; it is the truth).
//   - close resets the stop-loss fields and sold_targets but keeps
//     sell_occurred to block same-day re-entry.
//
// The remaining rule — an armed stop-loss always has exactly one
// full-quantity sell intended — spans this store and the ledger; the
// execution handler maintains it and its tests assert it.
//
// Every mutation writes through to the persisted document.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::Holding;
use crate::config_store::ConfigStore;
use crate::errors::TradingError;
use crate::market_hours;
use crate::types::TargetName;

/// Persisted per-instrument position record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub code: String,
    #[serde(default)]
    pub name: String,
    /// Authoritative from broker balance events.
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub avg_price: i64,
    /// Denominator for the ladder ratios; set on the first balance increase
    /// from zero, refreshed on pyramiding, replaced on manual partial sells.
    #[serde(default)]
    pub initial_quantity: i64,
    /// Audit-only: the initial quantity before a manual-sell recompute
    /// replaced it.
    #[serde(default)]
    pub original_initial_quantity: i64,
    /// How many staged buys have filled (0..=max_buy_count).
    #[serde(default)]
    pub buy_count: u32,
    /// Basis for the 2nd/3rd staged-buy prices.
    #[serde(default)]
    pub first_buy_price: i64,
    #[serde(default)]
    pub last_buy_price: i64,
    /// Running average across fills of the current buy cycle.
    #[serde(default)]
    pub last_executed_price: i64,
    #[serde(default)]
    pub last_executed_qty: i64,
    /// Ladder rungs that have filled, in fill order (grows monotonically).
    #[serde(default)]
    pub sold_targets: Vec<TargetName>,
    /// Sticky: once any sell fills, no new buys until the position closes
    /// and a new trading day begins.
    #[serde(default)]
    pub sell_occurred: bool,
    #[serde(default)]
    pub stoploss_triggered: bool,
    #[serde(default)]
    pub stoploss_price: i64,
    /// Set on an invariant violation; decisions skip this instrument until
    /// the next startup sync.
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub last_update: String,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity > 0
    }

    pub fn has_sold(&self, target: TargetName) -> bool {
        self.sold_targets.contains(&target)
    }

    /// Denominator for ladder ratio computation.
    pub fn ladder_base(&self) -> i64 {
        if self.initial_quantity > 0 {
            self.initial_quantity
        } else {
            self.quantity
        }
    }
}

/// What a balance event did to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceTransition {
    /// Empty → Open.
    Opened { quantity: i64 },
    /// Open, quantity increased (a staged buy filled).
    Pyramided { old_quantity: i64, quantity: i64 },
    /// Open, quantity decreased but position survives.
    Reduced { old_quantity: i64, quantity: i64 },
    /// Quantity reached zero.
    Closed { old_quantity: i64 },
    /// Only the average price moved.
    Unchanged,
}

pub struct PositionStore {
    store: Arc<ConfigStore>,
}

impl PositionStore {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, code: &str) -> Option<Position> {
        self.store.read(|doc| doc.positions.get(code).cloned())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Position> {
        self.store.read(|doc| doc.positions.clone())
    }

    /// Instruments currently held.
    pub fn holders(&self) -> Vec<String> {
        self.store.read(|doc| {
            doc.positions
                .iter()
                .filter(|(_, p)| p.quantity > 0)
                .map(|(code, _)| code.clone())
                .collect()
        })
    }

    pub fn holder_count(&self) -> usize {
        self.store
            .read(|doc| doc.positions.values().filter(|p| p.quantity > 0).count())
    }

    pub fn insert(&self, code: &str, position: Position) {
        self.store.mutate(|doc| {
            doc.positions.insert(code.to_string(), position);
        });
    }

    /// Apply `f` to an existing position. Returns false when absent.
    pub fn with_position(&self, code: &str, f: impl FnOnce(&mut Position)) -> bool {
        self.store.mutate(|doc| match doc.positions.get_mut(code) {
            Some(p) => {
                f(p);
                p.last_update = market_hours::now_stamp();
                true
            }
            None => false,
        })
    }

    /// Record the placeholder written when the first buy order goes out,
    /// before any fill arrives.
    pub fn record_first_buy_order(&self, code: &str, name: &str, buy_price: i64, ma: i64) {
        let position = Position {
            code: code.to_string(),
            name: name.to_string(),
            buy_count: 1,
            first_buy_price: buy_price,
            last_buy_price: buy_price,
            last_update: market_hours::now_stamp(),
            ..Default::default()
        };
        info!(code, name, buy_price, ma, "position placeholder recorded for first buy");
        self.insert(code, position);
    }

    // -------------------------------------------------------------------------
    // FSM core
    // -------------------------------------------------------------------------

    /// Fold an authoritative balance event into the state machine. The
    /// caller runs the side-effects (ladder placement, cancels) based on the
    /// returned transition.
    pub fn apply_balance(
        &self,
        code: &str,
        quantity: i64,
        avg_price: i64,
    ) -> Result<BalanceTransition, TradingError> {
        self.store.mutate(|doc| {
            let position = doc.positions.entry(code.to_string()).or_insert_with(|| Position {
                code: code.to_string(),
                ..Default::default()
            });
            let old_quantity = position.quantity;
            position.last_update = market_hours::now_stamp();

            if quantity > old_quantity {
                if position.sell_occurred {
                    // Pyramiding after a sell is illegal. Record the
                    // broker's truth but freeze the instrument.
                    position.quantity = quantity;
                    position.avg_price = avg_price;
                    position.frozen = true;
                    error!(
                        code,
                        old_quantity,
                        quantity,
                        "balance increased after a sell: invariant violated, instrument frozen"
                    );
                    return Err(TradingError::InvariantViolation {
                        inst: code.to_string(),
                        detail: format!(
                            "quantity increased {old_quantity} -> {quantity} after sell_occurred"
                        ),
                    });
                }

                position.quantity = quantity;
                position.avg_price = avg_price;

                if old_quantity == 0 {
                    position.buy_count = position.buy_count.max(1);
                    position.initial_quantity = quantity;
                    if position.original_initial_quantity == 0 {
                        position.original_initial_quantity = quantity;
                    }
                    info!(code, quantity, avg_price, "position opened");
                    Ok(BalanceTransition::Opened { quantity })
                } else {
                    position.buy_count = position.buy_count.saturating_add(1);
                    position.initial_quantity = quantity;
                    info!(
                        code,
                        old_quantity,
                        quantity,
                        buy_count = position.buy_count,
                        "staged buy settled"
                    );
                    Ok(BalanceTransition::Pyramided {
                        old_quantity,
                        quantity,
                    })
                }
            } else if quantity < old_quantity {
                position.quantity = quantity;
                position.avg_price = avg_price;
                position.sell_occurred = true;

                if quantity == 0 {
                    // Reset stop-loss state and the rung history, keep the
                    // sticky sell flag.
                    position.sold_targets.clear();
                    position.stoploss_triggered = false;
                    position.stoploss_price = 0;
                    position.buy_count = 0;
                    position.initial_quantity = 0;
                    info!(code, old_quantity, "position fully closed");
                    Ok(BalanceTransition::Closed { old_quantity })
                } else {
                    info!(code, old_quantity, quantity, "position reduced by sell");
                    Ok(BalanceTransition::Reduced {
                        old_quantity,
                        quantity,
                    })
                }
            } else {
                position.avg_price = avg_price;
                Ok(BalanceTransition::Unchanged)
            }
        })
    }

    /// Rung history only grows. Returns whether the rung was new.
    pub fn mark_sold_target(&self, code: &str, target: TargetName) -> bool {
        self.store.mutate(|doc| match doc.positions.get_mut(code) {
            Some(p) => {
                if p.sold_targets.contains(&target) {
                    false
                } else {
                    p.sold_targets.push(target);
                    p.sell_occurred = true;
                    p.last_update = market_hours::now_stamp();
                    true
                }
            }
            None => false,
        })
    }

    /// Arm the stop-loss: sticky until the position closes.
    pub fn set_stoploss(&self, code: &str, price: i64) {
        self.with_position(code, |p| {
            p.stoploss_triggered = true;
            p.stoploss_price = price;
            p.sell_occurred = true;
            if !p.sold_targets.contains(&TargetName::StopLoss) {
                p.sold_targets.push(TargetName::StopLoss);
            }
        });
    }

    pub fn freeze(&self, code: &str, detail: &str) {
        warn!(code, detail, "freezing instrument decisions");
        self.with_position(code, |p| p.frozen = true);
    }

    // -------------------------------------------------------------------------
    // Startup sync & rollover
    // -------------------------------------------------------------------------

    /// Refresh quantity/average from the broker's holdings, creating records
    /// for unknown instruments and keeping the sticky flags of known ones.
    pub fn sync_from_holdings(&self, holdings: &[Holding]) {
        self.store.mutate(|doc| {
            for h in holdings {
                match doc.positions.get_mut(&h.code) {
                    Some(p) => {
                        p.quantity = h.quantity;
                        p.avg_price = h.avg_price;
                        if p.name.is_empty() {
                            p.name = h.name.clone();
                        }
                        if p.initial_quantity == 0 {
                            p.initial_quantity = h.quantity;
                        }
                        p.last_update = market_hours::now_stamp();
                    }
                    None => {
                        doc.positions.insert(
                            h.code.clone(),
                            Position {
                                code: h.code.clone(),
                                name: h.name.clone(),
                                quantity: h.quantity,
                                avg_price: h.avg_price,
                                initial_quantity: h.quantity,
                                original_initial_quantity: h.quantity,
                                buy_count: 1,
                                last_buy_price: h.avg_price,
                                last_update: market_hours::now_stamp(),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
        });
        info!(holdings = holdings.len(), "positions synced from account balance");
    }

    /// Zero out recorded positions the broker no longer reports (sold while
    /// the engine was down).
    pub fn cleanup_missing(&self, actually_held: &HashSet<String>) {
        self.store.mutate(|doc| {
            for (code, p) in doc.positions.iter_mut() {
                if p.quantity > 0 && !actually_held.contains(code) {
                    warn!(code, "recorded position absent from balance: treating as sold out");
                    p.quantity = 0;
                    p.sell_occurred = true;
                    p.sold_targets.clear();
                    p.stoploss_triggered = false;
                    p.stoploss_price = 0;
                    p.buy_count = 0;
                    p.initial_quantity = 0;
                    p.last_update = market_hours::now_stamp();
                }
            }
        });
    }

    /// Trading-day rollover: closed positions become re-enterable.
    pub fn rollover_new_day(&self) {
        self.store.mutate(|doc| {
            for p in doc.positions.values_mut() {
                if p.quantity == 0 {
                    p.sell_occurred = false;
                    p.frozen = false;
                }
            }
        });
        info!("closed positions reset for the new trading day");
    }

    /// Startup sync lifts the decision freeze everywhere.
    pub fn clear_frozen_all(&self) {
        self.store.mutate(|doc| {
            for p in doc.positions.values_mut() {
                p.frozen = false;
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PositionStore {
        PositionStore::new(Arc::new(ConfigStore::in_memory()))
    }

    #[test]
    fn first_balance_opens_position() {
        let s = store();
        let t = s.apply_balance("005930", 124, 8_050).unwrap();
        assert_eq!(t, BalanceTransition::Opened { quantity: 124 });
        let p = s.get("005930").unwrap();
        assert_eq!(p.buy_count, 1);
        assert_eq!(p.initial_quantity, 124);
        assert!(!p.sell_occurred);
    }

    #[test]
    fn pyramiding_bumps_buy_count_and_denominator() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        let t = s.apply_balance("005930", 261, 7_420).unwrap();
        assert_eq!(
            t,
            BalanceTransition::Pyramided {
                old_quantity: 124,
                quantity: 261
            }
        );
        let p = s.get("005930").unwrap();
        assert_eq!(p.buy_count, 2);
        assert_eq!(p.initial_quantity, 261);
    }

    #[test]
    fn sell_reduction_sets_sticky_flag() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        let t = s.apply_balance("005930", 87, 8_050).unwrap();
        assert_eq!(
            t,
            BalanceTransition::Reduced {
                old_quantity: 124,
                quantity: 87
            }
        );
        assert!(s.get("005930").unwrap().sell_occurred);
    }

    #[test]
    fn buy_after_sell_violates_and_freezes() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        s.apply_balance("005930", 87, 8_050).unwrap();

        let err = s.apply_balance("005930", 100, 8_000).unwrap_err();
        assert!(matches!(err, TradingError::InvariantViolation { .. }));
        let p = s.get("005930").unwrap();
        assert!(p.frozen);
        // Broker truth still recorded.
        assert_eq!(p.quantity, 100);
    }

    #[test]
    fn close_resets_stoploss_but_keeps_sell_flag() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        s.mark_sold_target("005930", TargetName::Profit1);
        s.set_stoploss("005930", 8_000);

        let t = s.apply_balance("005930", 0, 0).unwrap();
        assert_eq!(t, BalanceTransition::Closed { old_quantity: 124 });
        let p = s.get("005930").unwrap();
        assert!(p.sold_targets.is_empty());
        assert!(!p.stoploss_triggered);
        assert_eq!(p.stoploss_price, 0);
        assert!(p.sell_occurred, "re-entry must stay blocked today");
    }

    #[test]
    fn sold_targets_grow_monotonically() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        assert!(s.mark_sold_target("005930", TargetName::Profit1));
        assert!(!s.mark_sold_target("005930", TargetName::Profit1));
        assert!(s.mark_sold_target("005930", TargetName::Profit2));
        assert_eq!(
            s.get("005930").unwrap().sold_targets,
            vec![TargetName::Profit1, TargetName::Profit2]
        );
    }

    #[test]
    fn rollover_unblocks_only_closed_positions() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        s.apply_balance("005930", 0, 0).unwrap();
        s.apply_balance("000660", 50, 100_000).unwrap();
        s.apply_balance("000660", 25, 100_000).unwrap();

        s.rollover_new_day();
        assert!(!s.get("005930").unwrap().sell_occurred);
        assert!(
            s.get("000660").unwrap().sell_occurred,
            "open position keeps its sticky flag across the rollover"
        );
    }

    #[test]
    fn sync_and_cleanup_reconcile_with_broker() {
        let s = store();
        s.apply_balance("005930", 124, 8_050).unwrap();
        s.apply_balance("000660", 10, 90_000).unwrap();

        let holdings = vec![Holding {
            code: "005930".into(),
            name: "삼성전자".into(),
            quantity: 124,
            avg_price: 8_050,
            current_price: 8_100,
            eval_amount: 0,
            profit: 0,
            profit_rate_pct: 0.0,
        }];
        s.sync_from_holdings(&holdings);
        let held: HashSet<String> = holdings.iter().map(|h| h.code.clone()).collect();
        s.cleanup_missing(&held);

        assert_eq!(s.get("005930").unwrap().quantity, 124);
        let gone = s.get("000660").unwrap();
        assert_eq!(gone.quantity, 0);
        assert!(gone.sell_occurred);
        assert_eq!(s.holders(), vec!["005930".to_string()]);
    }

    #[test]
    fn ladder_base_prefers_initial_quantity() {
        let mut p = Position {
            quantity: 87,
            initial_quantity: 124,
            ..Default::default()
        };
        assert_eq!(p.ladder_base(), 124);
        p.initial_quantity = 0;
        assert_eq!(p.ladder_base(), 87);
    }
}

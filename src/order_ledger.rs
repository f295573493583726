// =============================================================================
// OrderLedger — durable record of intended and pending orders
// =============================================================================
//
// Keyed by instrument. Every staged buy, ladder rung, and stop-loss order is
// written here before (or instead of, outside market hours) being sent to
// the brokerage, which is what makes crash-recovery restoration possible:
// the ledger is the engine's statement of which orders should exist.
//
// Entries marked `persist` (the stop-loss) survive same-day housekeeping and
// are re-placed on the next trading day if still unfilled.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config_store::ConfigStore;
use crate::market_hours;
use crate::types::{OrderSide, TargetName};

/// One intended order. Serialized field names match the historical state
/// file (`order_type` / `price`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    #[serde(rename = "order_type")]
    pub side: OrderSide,
    pub quantity: i64,
    #[serde(rename = "price")]
    pub limit_price: i64,
    /// Which staged buy this is (buys only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy_count: Option<u32>,
    /// Which ladder rung this is (sells only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<TargetName>,
    pub created_at: String,
    /// Re-place on a new trading day if unfilled (stop-loss).
    #[serde(default)]
    pub persist: bool,
}

impl PendingOrder {
    pub fn buy(quantity: i64, limit_price: i64, buy_count: u32) -> Self {
        Self {
            side: OrderSide::Buy,
            quantity,
            limit_price,
            buy_count: Some(buy_count),
            target_name: None,
            created_at: market_hours::now_stamp(),
            persist: false,
        }
    }

    pub fn sell(quantity: i64, limit_price: i64, target: TargetName) -> Self {
        Self {
            side: OrderSide::Sell,
            quantity,
            limit_price,
            buy_count: None,
            target_name: Some(target),
            created_at: market_hours::now_stamp(),
            persist: false,
        }
    }

    /// The stop-loss entry: full quantity, persisted across days.
    pub fn stoploss(quantity: i64, limit_price: i64) -> Self {
        Self {
            persist: true,
            ..Self::sell(quantity, limit_price, TargetName::StopLoss)
        }
    }
}

/// Ledger over the persisted document. All mutations write through.
pub struct OrderLedger {
    store: Arc<ConfigStore>,
}

impl OrderLedger {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Record an intended order. Duplicates — same side, price, and staged
    /// buy number — are ignored, making `save` idempotent. Returns whether
    /// the entry was new.
    pub fn save(&self, code: &str, order: PendingOrder) -> bool {
        self.store.mutate(|doc| {
            let entries = doc.pending_orders.entry(code.to_string()).or_default();
            let duplicate = entries.iter().any(|e| {
                e.side == order.side
                    && e.limit_price == order.limit_price
                    && e.buy_count == order.buy_count
            });
            if duplicate {
                return false;
            }
            debug!(
                code,
                side = %order.side,
                price = order.limit_price,
                qty = order.quantity,
                target = ?order.target_name,
                "ledger entry saved"
            );
            entries.push(order);
            true
        })
    }

    /// Remove entries matching the filters (a `None` filter matches all).
    pub fn remove_matching(
        &self,
        code: &str,
        side: OrderSide,
        price: Option<i64>,
        buy_count: Option<u32>,
    ) {
        self.store.mutate(|doc| {
            if let Some(entries) = doc.pending_orders.get_mut(code) {
                entries.retain(|e| {
                    !(e.side == side
                        && price.map(|p| e.limit_price == p).unwrap_or(true)
                        && buy_count.map(|b| e.buy_count == Some(b)).unwrap_or(true))
                });
                if entries.is_empty() {
                    doc.pending_orders.remove(code);
                }
            }
        });
    }

    /// Drop every entry for `code`, or only one side of them. Clears
    /// persisted entries too — callers doing same-day housekeeping use
    /// `retain_for` instead.
    pub fn clear_for(&self, code: &str, side: Option<OrderSide>) {
        self.store.mutate(|doc| match side {
            None => {
                doc.pending_orders.remove(code);
            }
            Some(side) => {
                if let Some(entries) = doc.pending_orders.get_mut(code) {
                    entries.retain(|e| e.side != side);
                    if entries.is_empty() {
                        doc.pending_orders.remove(code);
                    }
                }
            }
        });
    }

    /// Keep only entries satisfying `keep`. Entries with `persist` set are
    /// always kept (same-day housekeeping must not drop the stop-loss).
    pub fn retain_for(&self, code: &str, keep: impl Fn(&PendingOrder) -> bool) {
        self.store.mutate(|doc| {
            if let Some(entries) = doc.pending_orders.get_mut(code) {
                entries.retain(|e| e.persist || keep(e));
                if entries.is_empty() {
                    doc.pending_orders.remove(code);
                }
            }
        });
    }

    pub fn orders_for(&self, code: &str) -> Vec<PendingOrder> {
        self.store
            .read(|doc| doc.pending_orders.get(code).cloned().unwrap_or_default())
    }

    pub fn all(&self) -> BTreeMap<String, Vec<PendingOrder>> {
        self.store.read(|doc| doc.pending_orders.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.store.read(|doc| doc.pending_orders.is_empty())
    }

    /// Find the entry a fill at `price` corresponds to.
    pub fn find_at_price(&self, code: &str, side: OrderSide, price: i64) -> Option<PendingOrder> {
        self.store.read(|doc| {
            doc.pending_orders.get(code).and_then(|entries| {
                entries
                    .iter()
                    .find(|e| e.side == side && e.limit_price == price)
                    .cloned()
            })
        })
    }

    /// Whether a rung with this target is already intended for `code`.
    pub fn has_target(&self, code: &str, target: TargetName) -> bool {
        self.store.read(|doc| {
            doc.pending_orders
                .get(code)
                .map(|entries| entries.iter().any(|e| e.target_name == Some(target)))
                .unwrap_or(false)
        })
    }

    pub fn sell_entries(&self, code: &str) -> Vec<PendingOrder> {
        self.orders_for(code)
            .into_iter()
            .filter(|e| e.side == OrderSide::Sell)
            .collect()
    }

    /// Replace the stop-loss entry's quantity (partial fills shrink it).
    pub fn update_stoploss_quantity(&self, code: &str, quantity: i64) {
        self.store.mutate(|doc| {
            if let Some(entries) = doc.pending_orders.get_mut(code) {
                for e in entries.iter_mut() {
                    if e.target_name == Some(TargetName::StopLoss) {
                        e.quantity = quantity;
                    }
                }
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

    fn ledger() -> OrderLedger {
        OrderLedger::new(Arc::new(ConfigStore::in_memory()))
    }

    #[test]
    fn save_is_idempotent_on_duplicates() {
        let l = ledger();
        assert!(l.save("005930", PendingOrder::buy(124, 8_050, 1)));
        assert!(!l.save("005930", PendingOrder::buy(124, 8_050, 1)));
        assert_eq!(l.orders_for("005930").len(), 1);

        // A different staged buy at the same price is a distinct entry.
        assert!(l.save("005930", PendingOrder::buy(137, 8_050, 2)));
        assert_eq!(l.orders_for("005930").len(), 2);
    }

    #[test]
    fn remove_matching_filters() {
        let l = ledger();
        l.save("005930", PendingOrder::buy(124, 8_050, 1));
        l.save("005930", PendingOrder::buy(137, 7_250, 2));
        l.save("005930", PendingOrder::sell(37, 8_290, TargetName::Profit1));

        l.remove_matching("005930", OrderSide::Buy, Some(7_250), None);
        let rest = l.orders_for("005930");
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|e| e.limit_price != 7_250));

        l.remove_matching("005930", OrderSide::Sell, None, None);
        assert_eq!(l.orders_for("005930").len(), 1);
    }

    #[test]
    fn clear_for_side_and_all() {
        let l = ledger();
        l.save("005930", PendingOrder::buy(124, 8_050, 1));
        l.save("005930", PendingOrder::sell(37, 8_290, TargetName::Profit1));
        l.clear_for("005930", Some(OrderSide::Buy));
        assert_eq!(l.orders_for("005930").len(), 1);
        l.clear_for("005930", None);
        assert!(l.is_empty());
    }

    #[test]
    fn housekeeping_spares_persisted_entries() {
        let l = ledger();
        l.save("005930", PendingOrder::sell(37, 8_290, TargetName::Profit1));
        l.save("005930", PendingOrder::stoploss(87, 8_000));

        // Drop everything housekeeping-style; the stop-loss must survive.
        l.retain_for("005930", |_| false);
        let rest = l.orders_for("005930");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].target_name, Some(TargetName::StopLoss));
        assert!(rest[0].persist);
    }

    #[test]
    fn find_at_price_identifies_the_fill() {
        let l = ledger();
        l.save("005930", PendingOrder::sell(37, 8_290, TargetName::Profit1));
        l.save("005930", PendingOrder::sell(37, 8_450, TargetName::Profit2));

        let hit = l.find_at_price("005930", OrderSide::Sell, 8_450).unwrap();
        assert_eq!(hit.target_name, Some(TargetName::Profit2));
        assert!(l.find_at_price("005930", OrderSide::Sell, 9_999).is_none());
        assert!(l.find_at_price("005930", OrderSide::Buy, 8_450).is_none());
    }

    #[test]
    fn stoploss_quantity_tracks_partial_fills() {
        let l = ledger();
        l.save("005930", PendingOrder::stoploss(87, 8_000));
        l.update_stoploss_quantity("005930", 40);
        let entry = l.find_at_price("005930", OrderSide::Sell, 8_000).unwrap();
        assert_eq!(entry.quantity, 40);
    }
}

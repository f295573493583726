// =============================================================================
// ConfigStore — the single persisted JSON document, with atomic save
// =============================================================================
//
// Everything the engine must remember across restarts lives in one JSON
// document: strategy parameters, the watchlist, positions, the pending-order
// ledger, session flags, and the execution audit. Every mutation is a
// read-modify-write under one lock followed by an atomic tmp + rename save,
// so a crash can never leave a half-written file.
//
// Every field carries a serde default; loading an older or partial document
// fills in the gaps instead of failing.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::market_hours;
use crate::order_ledger::PendingOrder;
use crate::position_store::Position;
use crate::types::OrderSide;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_envelope_period() -> usize {
    20
}

fn default_envelope_percent() -> i64 {
    19
}

fn default_envelope_buy_percent() -> i64 {
    20
}

fn default_max_buy_count() -> u32 {
    3
}

fn default_additional_buy_drop_percent() -> i64 {
    10
}

fn default_buy_amount_per_stock() -> i64 {
    1_000_000
}

fn default_max_holding_stocks() -> usize {
    3
}

fn default_profit_targets() -> Vec<f64> {
    vec![2.95, 4.95, 6.95]
}

fn default_profit_sell_ratios() -> Vec<i64> {
    vec![30, 30, 30]
}

fn default_ma_sell_ratio() -> i64 {
    10
}

fn default_order_retry_count() -> u32 {
    3
}

fn default_order_retry_interval_ms() -> u64 {
    1_000
}

fn default_reconnect_interval_sec() -> u64 {
    10
}

fn default_max_watchlist_count() -> usize {
    200
}

// =============================================================================
// Sections
// =============================================================================

/// Brokerage session settings. The account number is filled in after login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub account_number: String,
    #[serde(default)]
    pub account_password: String,
    #[serde(default)]
    pub use_mock_trading: bool,
}

/// Entry-side strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyConfig {
    /// Moving-average period for the envelope.
    #[serde(default = "default_envelope_period")]
    pub envelope_period: usize,

    /// Trigger band: a buy fires at `MA · (1 − percent/100)`.
    #[serde(default = "default_envelope_percent")]
    pub envelope_percent: i64,

    /// Placement band: the limit order rests at the `−buy_percent` envelope
    /// line plus one tick.
    #[serde(default = "default_envelope_buy_percent")]
    pub envelope_buy_percent: i64,

    /// Staged buys per position (1st entry plus pre-placed 2nd/3rd).
    #[serde(default = "default_max_buy_count")]
    pub max_buy_count: u32,

    /// Drop between staged buys, as a percentage of the previous stage.
    #[serde(default = "default_additional_buy_drop_percent")]
    pub additional_buy_drop_percent: i64,

    /// Budget per staged buy, in KRW.
    #[serde(default = "default_buy_amount_per_stock")]
    pub buy_amount_per_stock: i64,

    /// Cap on simultaneously held instruments.
    #[serde(default = "default_max_holding_stocks")]
    pub max_holding_stocks: usize,
}

impl Default for BuyConfig {
    fn default() -> Self {
        Self {
            envelope_period: default_envelope_period(),
            envelope_percent: default_envelope_percent(),
            envelope_buy_percent: default_envelope_buy_percent(),
            max_buy_count: default_max_buy_count(),
            additional_buy_drop_percent: default_additional_buy_drop_percent(),
            buy_amount_per_stock: default_buy_amount_per_stock(),
            max_holding_stocks: default_max_holding_stocks(),
        }
    }
}

/// Exit-side strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellConfig {
    /// Profit rungs as percentages over the average price.
    #[serde(default = "default_profit_targets")]
    pub profit_targets: Vec<f64>,

    /// Quantity share (of the initial quantity) sold at each profit rung.
    #[serde(default = "default_profit_sell_ratios")]
    pub profit_sell_ratios: Vec<i64>,

    /// Share sold at the moving-average rung (the remainder in practice).
    #[serde(default = "default_ma_sell_ratio")]
    pub ma20_sell_ratio: i64,

    /// Reserved. Stop-loss always goes out as a limit at the tick-floored
    /// last price; this flag is parsed and kept for older documents.
    #[serde(default)]
    pub stoploss_use_market_order: bool,
}

impl Default for SellConfig {
    fn default() -> Self {
        Self {
            profit_targets: default_profit_targets(),
            profit_sell_ratios: default_profit_sell_ratios(),
            ma20_sell_ratio: default_ma_sell_ratio(),
            stoploss_use_market_order: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default = "default_order_retry_count")]
    pub order_retry_count: u32,
    #[serde(default = "default_order_retry_interval_ms")]
    pub order_retry_interval_ms: u64,
    #[serde(default = "default_reconnect_interval_sec")]
    pub reconnect_interval_sec: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            order_retry_count: default_order_retry_count(),
            order_retry_interval_ms: default_order_retry_interval_ms(),
            reconnect_interval_sec: default_reconnect_interval_sec(),
        }
    }
}

/// Session flags reset at every trading-day rollover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub last_trading_date: String,
    #[serde(default)]
    pub auto_trading_enabled: bool,
    #[serde(default)]
    pub orders_restored: bool,
    #[serde(default)]
    pub state_synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchItem {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

/// One fill in the audit log, deduplicated by order number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "type")]
    pub side: OrderSide,
    pub quantity: i64,
    pub price: i64,
    /// Fill time, `HHMMSS`.
    pub time: String,
    #[serde(default)]
    pub order_no: String,
}

/// `date(YYYYMMDD) → instrument → fills`.
pub type ExecutionHistory = BTreeMap<String, BTreeMap<String, Vec<ExecutionRecord>>>;

// =============================================================================
// Document
// =============================================================================

/// The whole persisted state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub kiwoom: BrokerSettings,
    #[serde(default)]
    pub buy: BuyConfig,
    #[serde(default)]
    pub sell: SellConfig,
    #[serde(default)]
    pub watchlist: Vec<WatchItem>,
    #[serde(default = "default_max_watchlist_count")]
    pub max_watchlist_count: usize,
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
    #[serde(default)]
    pub pending_orders: BTreeMap<String, Vec<PendingOrder>>,
    #[serde(default)]
    pub session: SessionInfo,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub execution_history: ExecutionHistory,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            kiwoom: BrokerSettings::default(),
            buy: BuyConfig::default(),
            sell: SellConfig::default(),
            watchlist: Vec::new(),
            max_watchlist_count: default_max_watchlist_count(),
            positions: BTreeMap::new(),
            pending_orders: BTreeMap::new(),
            session: SessionInfo::default(),
            error_handling: ErrorHandlingConfig::default(),
            execution_history: ExecutionHistory::new(),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Owner of the document. All reads and mutations go through the closure
/// APIs so the lock scope stays obvious; every mutation persists before the
/// lock is released.
pub struct ConfigStore {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
}

impl ConfigStore {
    /// Load from `path`, falling back to defaults when the file is missing.
    /// A malformed file is an error: silently discarding positions would be
    /// worse than refusing to start.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read state file {}", path.display()))?;
            let doc: Document = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state file {}", path.display()))?;
            info!(
                path = %path.display(),
                watchlist = doc.watchlist.len(),
                positions = doc.positions.len(),
                "state file loaded"
            );
            doc
        } else {
            info!(path = %path.display(), "no state file yet, starting from defaults");
            Document::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            doc: Mutex::new(doc),
        })
    }

    /// Store without a backing file; mutations skip the save. Tests and
    /// dry-runs use this.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(Document::default()),
        }
    }

    /// Read access to the document.
    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.doc.lock())
    }

    /// Mutate the document and persist atomically before returning.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let mut doc = self.doc.lock();
        let result = f(&mut doc);
        if let Err(e) = self.persist(&doc) {
            error!(error = %e, "failed to persist state file");
        }
        result
    }

    /// Force a save of the current document (shutdown flush).
    pub fn flush(&self) -> Result<()> {
        let doc = self.doc.lock();
        self.persist(&doc)
    }

    fn persist(&self, doc: &Document) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content =
            serde_json::to_string_pretty(doc).context("failed to serialize state document")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Section snapshots
    // -------------------------------------------------------------------------

    pub fn buy(&self) -> BuyConfig {
        self.read(|d| d.buy.clone())
    }

    pub fn sell(&self) -> SellConfig {
        self.read(|d| d.sell.clone())
    }

    pub fn error_handling(&self) -> ErrorHandlingConfig {
        self.read(|d| d.error_handling.clone())
    }

    pub fn account_number(&self) -> Option<String> {
        self.read(|d| {
            if d.kiwoom.account_number.is_empty() {
                None
            } else {
                Some(d.kiwoom.account_number.clone())
            }
        })
    }

    pub fn set_account_number(&self, account: &str) {
        self.mutate(|d| d.kiwoom.account_number = account.to_string());
    }

    // -------------------------------------------------------------------------
    // Watchlist
    // -------------------------------------------------------------------------

    pub fn watchlist_codes(&self) -> Vec<String> {
        self.read(|d| d.watchlist.iter().map(|w| w.code.clone()).collect())
    }

    pub fn add_to_watchlist(&self, code: &str, name: &str) -> Result<()> {
        self.mutate(|d| {
            if d.watchlist.len() >= d.max_watchlist_count {
                bail!("watchlist is full (max {})", d.max_watchlist_count);
            }
            if d.watchlist.iter().any(|w| w.code == code) {
                bail!("{code} is already on the watchlist");
            }
            d.watchlist.push(WatchItem {
                code: code.to_string(),
                name: name.to_string(),
            });
            Ok(())
        })
    }

    pub fn remove_from_watchlist(&self, code: &str) {
        self.mutate(|d| d.watchlist.retain(|w| w.code != code));
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    pub fn session(&self) -> SessionInfo {
        self.read(|d| d.session.clone())
    }

    pub fn last_trading_date(&self) -> String {
        self.read(|d| d.session.last_trading_date.clone())
    }

    /// New trading day: clear the restoration flags so startup and the
    /// market-open watcher run the full restore path again.
    pub fn reset_session_for_new_day(&self, today: &str) {
        self.mutate(|d| {
            d.session.last_trading_date = today.to_string();
            d.session.orders_restored = false;
            d.session.state_synced = false;
        });
        info!(date = today, "session reset for new trading day");
    }

    pub fn is_orders_restored(&self) -> bool {
        self.read(|d| d.session.orders_restored)
    }

    pub fn set_orders_restored(&self, restored: bool) {
        self.mutate(|d| d.session.orders_restored = restored);
    }

    pub fn is_state_synced(&self) -> bool {
        self.read(|d| d.session.state_synced)
    }

    pub fn set_state_synced(&self, synced: bool) {
        self.mutate(|d| d.session.state_synced = synced);
    }

    pub fn update_session(&self, last_trading_date: &str, auto_trading_enabled: bool) {
        self.mutate(|d| {
            d.session.last_trading_date = last_trading_date.to_string();
            d.session.auto_trading_enabled = auto_trading_enabled;
        });
    }

    // -------------------------------------------------------------------------
    // Execution audit
    // -------------------------------------------------------------------------

    /// Record a fill under `(date, code)`. Duplicate order numbers are
    /// dropped. Returns whether the record was new.
    pub fn save_execution(&self, code: &str, record: ExecutionRecord, date: Option<&str>) -> bool {
        let date = date
            .map(str::to_string)
            .unwrap_or_else(market_hours::today_string);
        self.mutate(|d| {
            let fills = d
                .execution_history
                .entry(date)
                .or_default()
                .entry(code.to_string())
                .or_default();
            if !record.order_no.is_empty()
                && fills.iter().any(|r| r.order_no == record.order_no)
            {
                return false;
            }
            fills.push(record);
            true
        })
    }

    pub fn executions_for(&self, code: &str, date: Option<&str>) -> Vec<ExecutionRecord> {
        let date = date
            .map(str::to_string)
            .unwrap_or_else(market_hours::today_string);
        self.read(|d| {
            d.execution_history
                .get(&date)
                .and_then(|m| m.get(code))
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Drop audit entries older than `keep_days`.
    pub fn clear_old_executions(&self, keep_days: i64) {
        let cutoff = (Local::now() - ChronoDuration::days(keep_days))
            .format("%Y%m%d")
            .to_string();
        let removed = self.mutate(|d| {
            let before = d.execution_history.len();
            d.execution_history.retain(|date, _| date.as_str() >= cutoff.as_str());
            before - d.execution_history.len()
        });
        if removed > 0 {
            warn!(removed, cutoff = %cutoff, "pruned old execution history");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_strategy_parameters() {
        let buy = BuyConfig::default();
        assert_eq!(buy.envelope_period, 20);
        assert_eq!(buy.envelope_percent, 19);
        assert_eq!(buy.envelope_buy_percent, 20);
        assert_eq!(buy.max_buy_count, 3);
        assert_eq!(buy.additional_buy_drop_percent, 10);
        assert_eq!(buy.buy_amount_per_stock, 1_000_000);
        assert_eq!(buy.max_holding_stocks, 3);

        let sell = SellConfig::default();
        assert_eq!(sell.profit_targets, vec![2.95, 4.95, 6.95]);
        assert_eq!(sell.profit_sell_ratios, vec![30, 30, 30]);
        assert_eq!(sell.ma20_sell_ratio, 10);
        assert!(!sell.stoploss_use_market_order);

        let eh = ErrorHandlingConfig::default();
        assert_eq!(eh.order_retry_count, 3);
        assert_eq!(eh.order_retry_interval_ms, 1_000);
        assert_eq!(eh.reconnect_interval_sec, 10);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let doc: Document =
            serde_json::from_str(r#"{ "buy": { "envelope_percent": 15 } }"#).unwrap();
        assert_eq!(doc.buy.envelope_percent, 15);
        assert_eq!(doc.buy.envelope_period, 20);
        assert_eq!(doc.max_watchlist_count, 200);
        assert!(doc.positions.is_empty());
    }

    #[test]
    fn persist_load_persist_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = ConfigStore::load(&path).unwrap();
        store.add_to_watchlist("005930", "삼성전자").unwrap();
        store.set_account_number("8000000011");
        let first = std::fs::read_to_string(&path).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        reloaded.flush().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn malformed_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ConfigStore::load(&path).is_err());
    }

    #[test]
    fn watchlist_rejects_duplicates_and_overflow() {
        let store = ConfigStore::in_memory();
        store.add_to_watchlist("005930", "삼성전자").unwrap();
        assert!(store.add_to_watchlist("005930", "dup").is_err());

        store.mutate(|d| d.max_watchlist_count = 2);
        store.add_to_watchlist("000660", "SK하이닉스").unwrap();
        assert!(store.add_to_watchlist("035720", "카카오").is_err());
        assert_eq!(store.watchlist_codes(), vec!["005930", "000660"]);
    }

    #[test]
    fn session_rollover_resets_flags() {
        let store = ConfigStore::in_memory();
        store.set_orders_restored(true);
        store.set_state_synced(true);
        store.reset_session_for_new_day("20250801");
        assert!(!store.is_orders_restored());
        assert!(!store.is_state_synced());
        assert_eq!(store.last_trading_date(), "20250801");
    }

    #[test]
    fn executions_dedup_by_order_no() {
        let store = ConfigStore::in_memory();
        let rec = ExecutionRecord {
            side: OrderSide::Buy,
            quantity: 10,
            price: 8_050,
            time: "093000".into(),
            order_no: "0000001".into(),
        };
        assert!(store.save_execution("005930", rec.clone(), Some("20250801")));
        assert!(!store.save_execution("005930", rec, Some("20250801")));
        assert_eq!(store.executions_for("005930", Some("20250801")).len(), 1);
    }

    #[test]
    fn old_executions_are_pruned() {
        let store = ConfigStore::in_memory();
        let rec = ExecutionRecord {
            side: OrderSide::Sell,
            quantity: 1,
            price: 1_000,
            time: "100000".into(),
            order_no: "1".into(),
        };
        store.save_execution("005930", rec.clone(), Some("20200101"));
        store.save_execution("005930", rec, None);
        store.clear_old_executions(7);
        assert!(store.executions_for("005930", Some("20200101")).is_empty());
        assert_eq!(store.executions_for("005930", None).len(), 1);
    }
}

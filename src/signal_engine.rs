// =============================================================================
// SignalEngine — turns prices, candles, and position state into intents
// =============================================================================
//
// Entry: the trigger is the −envelope_percent band off the period MA; the
// resting limit goes at the −envelope_buy_percent band plus one tick, and
// the 2nd/3rd staged buys are priced off the previous stage at
// −additional_buy_drop_percent (plus one tick). Staged-buy prices quantize
// with the tick size of the MA itself, which is the reference price of the
// whole entry chain.
//
// Exit: a fixed ladder against the average price (three profit rungs plus
// the MA rung for the remainder), and a state-dependent stop-loss — armed
// only after the first rung has sold, firing when the price falls back to
// the average.
//
// Priority: stop-loss > ladder upkeep > buys.
// =============================================================================

use tracing::debug;

use crate::config_store::{BuyConfig, SellConfig};
use crate::market_data::Candle;
use crate::position_store::Position;
use crate::ta;
use crate::types::TargetName;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// A decision waiting to be dispatched as broker calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Keep the armed stop-loss order alive (re-place if it went missing).
    EnsureStoploss { code: String },
    /// Fire the stop-loss now.
    Stoploss { code: String, price: i64 },
    /// Make sure every eligible ladder rung is resting.
    EnsureSellLadder { code: String },
    /// First-time entry (stages 2/3 are pre-placed alongside it).
    Buy {
        code: String,
        price: i64,
        signal: BuySignal,
    },
}

impl Intent {
    pub fn code(&self) -> &str {
        match self {
            Self::EnsureStoploss { code }
            | Self::Stoploss { code, .. }
            | Self::EnsureSellLadder { code }
            | Self::Buy { code, .. } => code,
        }
    }

    /// Coarse label used for in-flight dedup of buy/stop-loss intents.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnsureStoploss { .. } => "ensure_stoploss",
            Self::Stoploss { .. } => "stoploss",
            Self::EnsureSellLadder { .. } => "ensure_sell",
            Self::Buy { .. } => "buy",
        }
    }
}

/// Fully priced first-time entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BuySignal {
    pub limit_price: i64,
    pub quantity: i64,
    /// Period MA the envelope hangs off, truncated to KRW.
    pub ma: i64,
    pub trigger_price: i64,
    pub envelope_lower: i64,
    /// Tick derived from the MA; the staged buys reuse it.
    pub tick: i64,
}

/// One pre-placed additional buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedBuy {
    pub buy_count: u32,
    pub price: i64,
    pub quantity: i64,
}

/// One rung of the sell ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderRung {
    pub target: TargetName,
    pub quantity: i64,
    pub price: i64,
}

/// Snapshot used by the log/summary surface.
#[derive(Debug, Clone)]
pub struct PositionSummary {
    pub code: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub buy_count: u32,
    pub current_price: i64,
    pub profit_rate_pct: f64,
    pub profit_amount: i64,
    pub eval_amount: i64,
    pub ma: Option<i64>,
    pub trigger_price: Option<i64>,
    pub envelope_lower: Option<i64>,
    pub sold_targets: Vec<TargetName>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SignalEngine;

impl SignalEngine {
    /// First-time entry check. `holder_count` guards the concurrent-holding
    /// cap; staged re-buys never originate from ticks (they are pre-placed).
    pub fn check_buy_signal(
        cfg: &BuyConfig,
        code: &str,
        current_price: i64,
        candles: &[Candle],
        position: Option<&Position>,
        holder_count: usize,
    ) -> Option<BuySignal> {
        if let Some(p) = position {
            if p.quantity > 0 || p.sell_occurred || p.stoploss_triggered || p.frozen {
                return None;
            }
            // A closed-out record from earlier today also blocks re-entry.
            if p.avg_price > 0 {
                return None;
            }
        }
        if holder_count >= cfg.max_holding_stocks {
            return None;
        }

        let ma = ta::ma_from_candles(candles, cfg.envelope_period)?;
        let (_, trigger) = ta::envelope(ma, cfg.envelope_percent);
        if (current_price as f64) > trigger {
            return None;
        }

        let (_, support) = ta::envelope(ma, cfg.envelope_buy_percent);
        let tick = ta::tick_size(ma as i64);
        let limit_price = ta::floor_to(support as i64, tick) + tick;
        if limit_price <= 0 {
            return None;
        }
        let quantity = cfg.buy_amount_per_stock / limit_price;
        if quantity <= 0 {
            debug!(code, limit_price, "buy amount too small for one share");
            return None;
        }

        Some(BuySignal {
            limit_price,
            quantity,
            ma: ma as i64,
            trigger_price: trigger as i64,
            envelope_lower: support as i64,
            tick,
        })
    }

    /// Prices and sizes for the pre-placed 2nd..max staged buys. Each stage
    /// drops `additional_buy_drop_percent` off the previous stage's limit,
    /// floored to the MA's tick plus one tick.
    pub fn staged_buys(cfg: &BuyConfig, first_limit: i64, tick: i64) -> Vec<StagedBuy> {
        let mut stages = Vec::new();
        let mut prev = first_limit;
        for buy_count in 2..=cfg.max_buy_count {
            let raw = prev as f64 * (1.0 - cfg.additional_buy_drop_percent as f64 / 100.0);
            let price = ta::floor_to(raw as i64, tick) + tick;
            if price <= 0 {
                break;
            }
            let quantity = cfg.buy_amount_per_stock / price;
            if quantity <= 0 {
                break;
            }
            stages.push(StagedBuy {
                buy_count,
                price,
                quantity,
            });
            prev = price;
        }
        stages
    }

    /// The rungs that should currently be resting, given what has already
    /// sold. Quantities are shares of `initial_qty` (the ladder denominator),
    /// clamped so the committed total never exceeds `current_qty`; the MA
    /// rung takes whatever remains.
    pub fn sell_ladder(
        cfg: &SellConfig,
        avg_price: i64,
        initial_qty: i64,
        current_qty: i64,
        ma: Option<f64>,
        sold: &[TargetName],
    ) -> Vec<LadderRung> {
        let mut rungs = Vec::new();
        if avg_price <= 0 || current_qty <= 0 || initial_qty <= 0 {
            return rungs;
        }

        let mut used = 0i64;
        for (i, target) in TargetName::PROFIT_RUNGS.iter().enumerate() {
            let rate = cfg.profit_targets.get(i).copied().unwrap_or(0.0);
            let ratio = cfg.profit_sell_ratios.get(i).copied().unwrap_or(0);
            if rate <= 0.0 || ratio <= 0 {
                continue;
            }
            let quantity = (initial_qty * ratio / 100).max(1);
            if sold.contains(target) {
                continue;
            }
            if used + quantity > current_qty {
                continue;
            }
            let price = ta::ceil_to_tick(avg_price as f64 * (1.0 + rate / 100.0));
            rungs.push(LadderRung {
                target: *target,
                quantity,
                price,
            });
            used += quantity;
        }

        if let Some(ma) = ma {
            if !sold.contains(&TargetName::MovingAverage) {
                let remaining = current_qty - used;
                if remaining > 0 {
                    rungs.push(LadderRung {
                        target: TargetName::MovingAverage,
                        quantity: remaining,
                        price: ta::ceil_to_tick(ma),
                    });
                }
            }
        }

        rungs
    }

    /// Stop-loss precondition: at least one rung already sold, the stop rung
    /// itself untouched, not yet armed, and the price back at (or below) the
    /// average.
    pub fn should_trigger_stoploss(position: &Position, current_price: i64) -> bool {
        position.quantity > 0
            && !position.stoploss_triggered
            && !position.sold_targets.is_empty()
            && !position.has_sold(TargetName::StopLoss)
            && position.avg_price > 0
            && current_price <= position.avg_price
    }

    /// Stop-loss limit price: last price floored to the tick ladder.
    pub fn stoploss_price(current_price: i64) -> i64 {
        ta::floor_to_tick(current_price as f64)
    }

    /// Produce this tick's intents in priority order. A firing stop-loss
    /// preempts everything else for the instrument.
    pub fn evaluate(
        buy_cfg: &BuyConfig,
        code: &str,
        current_price: i64,
        candles: &[Candle],
        position: Option<&Position>,
        holder_count: usize,
    ) -> Vec<Intent> {
        let mut intents = Vec::new();

        if let Some(p) = position {
            if p.frozen {
                return intents;
            }
            if p.stoploss_triggered && p.quantity > 0 {
                intents.push(Intent::EnsureStoploss {
                    code: code.to_string(),
                });
            }
            if Self::should_trigger_stoploss(p, current_price) {
                intents.push(Intent::Stoploss {
                    code: code.to_string(),
                    price: current_price,
                });
                return intents;
            }
            if p.quantity > 0 && !p.stoploss_triggered {
                intents.push(Intent::EnsureSellLadder {
                    code: code.to_string(),
                });
            }
        }

        if let Some(signal) =
            Self::check_buy_signal(buy_cfg, code, current_price, candles, position, holder_count)
        {
            intents.push(Intent::Buy {
                code: code.to_string(),
                price: current_price,
                signal,
            });
        }

        intents
    }

    /// Summary for logs and the display surface.
    pub fn position_summary(
        cfg: &BuyConfig,
        position: &Position,
        current_price: i64,
        candles: &[Candle],
    ) -> Option<PositionSummary> {
        if position.quantity == 0 {
            return None;
        }
        let trigger_levels =
            ta::EnvelopeLevels::from_candles(candles, cfg.envelope_period, cfg.envelope_percent);
        let buy_levels =
            ta::EnvelopeLevels::from_candles(candles, cfg.envelope_period, cfg.envelope_buy_percent);
        let ma = trigger_levels.map(|l| l.ma);
        let trigger = trigger_levels.map(|l| l.lower as i64);
        let lower = buy_levels.map(|l| l.lower as i64);

        let profit_rate = if position.avg_price > 0 {
            (current_price - position.avg_price) as f64 / position.avg_price as f64 * 100.0
        } else {
            0.0
        };

        Some(PositionSummary {
            code: position.code.clone(),
            quantity: position.quantity,
            avg_price: position.avg_price,
            buy_count: position.buy_count,
            current_price,
            profit_rate_pct: (profit_rate * 100.0).round() / 100.0,
            profit_amount: (current_price - position.avg_price) * position.quantity,
            eval_amount: current_price * position.quantity,
            ma: ma.map(|m| m as i64),
            trigger_price: trigger,
            envelope_lower: lower,
            sold_targets: position.sold_targets.clone(),
        })
    }
}

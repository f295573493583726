// =============================================================================
// KRX session clock — pre-market, regular session, trading-date helpers
// =============================================================================
//
// Session boundaries (exchange local time):
//   08:30 pre-market auction
//   09:00 regular session open
//   15:30 regular session close
//
// All checks take a `NaiveTime` so the decision code stays testable without
// touching the wall clock; the `*_now` variants read `chrono::Local`.
// =============================================================================

use chrono::{Local, NaiveTime, Timelike};

/// Pre-market auction start.
pub const PRE_MARKET_OPEN: (u32, u32) = (8, 30);
/// Regular session open.
pub const MARKET_OPEN: (u32, u32) = (9, 0);
/// Regular session close.
pub const MARKET_CLOSE: (u32, u32) = (15, 30);

fn t(hm: (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(hm.0, hm.1, 0).expect("static session boundary")
}

/// True during [08:30, 15:30] — the window in which the broker accepts and
/// keeps orders (pre-market auction included).
pub fn is_market_open_at(now: NaiveTime) -> bool {
    now >= t(PRE_MARKET_OPEN) && now <= t(MARKET_CLOSE)
}

/// True during the regular session [09:00, 15:30]. Manual orders and order
/// restoration are gated on this.
pub fn is_trading_time_at(now: NaiveTime) -> bool {
    now >= t(MARKET_OPEN) && now <= t(MARKET_CLOSE)
}

/// Today's trading date as `YYYYMMDD` (session-rollover key).
pub fn today_string() -> String {
    Local::now().format("%Y%m%d").to_string()
}

/// Timestamp format used in persisted position / order records.
pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn local_time() -> NaiveTime {
    let now = Local::now();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
        .expect("wall clock within day")
}

/// Session clock handed to the decision code. Production uses the wall
/// clock; tests pin a time so session gating is deterministic.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    Wall,
    Fixed(NaiveTime),
}

impl Clock {
    pub fn fixed(h: u32, m: u32) -> Self {
        Self::Fixed(NaiveTime::from_hms_opt(h, m, 0).expect("valid fixed time"))
    }

    pub fn now(&self) -> NaiveTime {
        match self {
            Self::Wall => local_time(),
            Self::Fixed(t) => *t,
        }
    }

    pub fn is_market_open(&self) -> bool {
        is_market_open_at(self.now())
    }

    pub fn is_trading_time(&self) -> bool {
        is_trading_time_at(self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn pre_market_counts_as_open_but_not_trading() {
        assert!(is_market_open_at(at(8, 30)));
        assert!(is_market_open_at(at(8, 45)));
        assert!(!is_trading_time_at(at(8, 45)));
    }

    #[test]
    fn regular_session_bounds() {
        assert!(is_trading_time_at(at(9, 0)));
        assert!(is_trading_time_at(at(12, 0)));
        assert!(is_trading_time_at(at(15, 30)));
        assert!(!is_trading_time_at(at(15, 31)));
        assert!(!is_trading_time_at(at(8, 59)));
    }

    #[test]
    fn overnight_is_closed() {
        assert!(!is_market_open_at(at(7, 0)));
        assert!(!is_market_open_at(at(16, 0)));
        assert!(!is_market_open_at(at(23, 59)));
    }
}

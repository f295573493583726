// =============================================================================
// Exchange tick ladder — minimum price increments by price band
// =============================================================================
//
// Band ladder (KRW):
//   < 1,000     → 1
//   < 5,000     → 5
//   < 10,000    → 10
//   < 50,000    → 50
//   < 100,000   → 100
//   < 500,000   → 500
//   otherwise   → 1,000
//
// Rounding truncates the fractional part first and then aligns to the tick
// of the truncated price, matching the brokerage's order-entry rules.
// =============================================================================

/// Minimum price increment at `price`.
pub fn tick_size(price: i64) -> i64 {
    if price < 1_000 {
        1
    } else if price < 5_000 {
        5
    } else if price < 10_000 {
        10
    } else if price < 50_000 {
        50
    } else if price < 100_000 {
        100
    } else if price < 500_000 {
        500
    } else {
        1_000
    }
}

/// Round `price` down to the tick ladder (tick taken at the price itself).
pub fn floor_to_tick(price: f64) -> i64 {
    let p = price as i64;
    floor_to(p, tick_size(p))
}

/// Round `price` up to the tick ladder (tick taken at the price itself).
pub fn ceil_to_tick(price: f64) -> i64 {
    let p = price as i64;
    ceil_to(p, tick_size(p))
}

/// Round an integer price down to a multiple of `tick`.
pub fn floor_to(price: i64, tick: i64) -> i64 {
    (price / tick) * tick
}

/// Round an integer price up to a multiple of `tick`.
pub fn ceil_to(price: i64, tick: i64) -> i64 {
    ((price + tick - 1) / tick) * tick
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_bands() {
        assert_eq!(tick_size(999), 1);
        assert_eq!(tick_size(1_000), 5);
        assert_eq!(tick_size(4_999), 5);
        assert_eq!(tick_size(5_000), 10);
        assert_eq!(tick_size(9_999), 10);
        assert_eq!(tick_size(10_000), 50);
        assert_eq!(tick_size(49_999), 50);
        assert_eq!(tick_size(50_000), 100);
        assert_eq!(tick_size(100_000), 500);
        assert_eq!(tick_size(500_000), 1_000);
        assert_eq!(tick_size(1_234_567), 1_000);
    }

    #[test]
    fn floor_and_ceil_align_to_tick() {
        assert_eq!(floor_to_tick(8_287.48), 8_280);
        assert_eq!(ceil_to_tick(8_287.48), 8_290);
        assert_eq!(ceil_to_tick(8_448.4), 8_450);
        assert_eq!(ceil_to_tick(10_000.0), 10_000);
        assert_eq!(floor_to_tick(8_000.0), 8_000);
    }

    #[test]
    fn rounding_brackets_the_price() {
        // floor <= p <= ceil, both divisible by the tick at the result, and
        // the bracket never exceeds two ticks even across band boundaries.
        for p in (1..200_000).step_by(7) {
            let p = p as f64 + 0.37;
            let lo = floor_to_tick(p);
            let hi = ceil_to_tick(p);
            assert!(lo as f64 <= p, "floor {lo} above {p}");
            assert!(hi as f64 >= p.trunc(), "ceil {hi} below {p}");
            assert_eq!(lo % tick_size(lo), 0, "floor {lo} off-ladder");
            assert_eq!(hi % tick_size(hi), 0, "ceil {hi} off-ladder");
            let t = tick_size(p as i64);
            assert!(hi - lo <= 2 * t, "bracket {lo}..{hi} wider than 2 ticks");
        }
    }

    #[test]
    fn fixed_tick_helpers() {
        // Staged-buy pricing quantizes with the tick of the envelope MA.
        let tick = tick_size(10_000);
        assert_eq!(tick, 50);
        assert_eq!(floor_to(8_000, tick) + tick, 8_050);
        assert_eq!(floor_to(7_245, tick) + tick, 7_250);
        assert_eq!(floor_to(6_525, tick) + tick, 6_550);
        assert_eq!(ceil_to(6_525, tick), 6_550);
    }
}

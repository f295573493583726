// =============================================================================
// Per-instrument price debouncer
// =============================================================================
//
// Collapses bursts of realtime ticks: the first event for an instrument is
// admitted, later ones are suppressed until the delay elapses. Suppressed
// events still overwrite the stored price so the next admitted event carries
// the freshest value.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default suppression window.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(200);

pub struct Debouncer {
    delay: Duration,
    last: Mutex<HashMap<String, (Instant, i64)>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::with_delay(DEBOUNCE_DELAY)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether this event should be processed now. Suppressed events
    /// only refresh the latched price.
    pub fn should_process(&self, code: &str, price: i64) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match last.get(code) {
            Some(&(admitted_at, _)) if now.duration_since(admitted_at) < self.delay => {
                // Keep the admission timestamp, refresh the payload.
                last.insert(code.to_string(), (admitted_at, price));
                false
            }
            _ => {
                last.insert(code.to_string(), (now, price));
                true
            }
        }
    }

    /// Latest price seen for `code`, admitted or suppressed.
    pub fn latest(&self, code: &str) -> Option<i64> {
        self.last.lock().get(code).map(|&(_, price)| price)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_admitted_burst_suppressed() {
        let d = Debouncer::with_delay(Duration::from_millis(50));
        assert!(d.should_process("005930", 70_000));
        assert!(!d.should_process("005930", 70_100));
        assert!(!d.should_process("005930", 70_200));
        // Suppressed events latched the freshest price.
        assert_eq!(d.latest("005930"), Some(70_200));
    }

    #[test]
    fn admits_again_after_delay() {
        let d = Debouncer::with_delay(Duration::from_millis(20));
        assert!(d.should_process("005930", 70_000));
        assert!(!d.should_process("005930", 70_100));
        std::thread::sleep(Duration::from_millis(25));
        assert!(d.should_process("005930", 70_300));
        assert_eq!(d.latest("005930"), Some(70_300));
    }

    #[test]
    fn instruments_are_independent() {
        let d = Debouncer::with_delay(Duration::from_millis(50));
        assert!(d.should_process("005930", 70_000));
        assert!(d.should_process("000660", 120_000));
        assert!(!d.should_process("005930", 70_100));
        assert!(!d.should_process("000660", 120_500));
    }
}

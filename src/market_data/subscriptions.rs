// =============================================================================
// Realtime subscription slot allocator
// =============================================================================
//
// The brokerage caps realtime registration at 100 instruments per slot and
// the engine uses two slots. Held positions always come first; the rest of
// the watchlist fills the remaining capacity and the overflow goes to the
// 30-second polling rotation.
//
// Re-run `plan` whenever the watchlist or holdings change; it returns the
// register/unregister diffs per slot so the adapter only sees changes.
// =============================================================================

use std::collections::HashSet;

/// Instruments per subscription slot.
pub const SLOT_CAPACITY: usize = 100;
/// Number of slots available.
pub const SLOT_COUNT: usize = 2;

/// Screen ids handed to the adapter, one per slot.
pub const SLOT_SCREENS: [&str; SLOT_COUNT] = ["1000", "1001"];

/// Diff produced by one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPlan {
    /// Per slot: instruments newly registered this pass.
    pub register: [Vec<String>; SLOT_COUNT],
    /// Per slot: instruments dropped this pass.
    pub unregister: [Vec<String>; SLOT_COUNT],
    /// Watchlist overflow served by the polling rotation.
    pub polling: Vec<String>,
}

pub struct SubscriptionAllocator {
    priority: HashSet<String>,
    slot_members: [HashSet<String>; SLOT_COUNT],
}

impl SubscriptionAllocator {
    pub fn new() -> Self {
        Self {
            priority: HashSet::new(),
            slot_members: Default::default(),
        }
    }

    /// Mark the current holders; they are always placed before the rest of
    /// the watchlist.
    pub fn set_priority(&mut self, holders: impl IntoIterator<Item = String>) {
        self.priority = holders.into_iter().collect();
    }

    /// Compute the register/unregister diffs for `watchlist` and commit the
    /// new membership.
    pub fn plan(&mut self, watchlist: &[String]) -> SubscriptionPlan {
        let priority: Vec<&String> = watchlist.iter().filter(|c| self.priority.contains(*c)).collect();
        let rest: Vec<&String> = watchlist.iter().filter(|c| !self.priority.contains(*c)).collect();

        let capacity = SLOT_CAPACITY * SLOT_COUNT;
        let active: Vec<String> = priority
            .into_iter()
            .chain(rest)
            .take(capacity)
            .cloned()
            .collect();

        let mut plan = SubscriptionPlan {
            polling: watchlist
                .iter()
                .filter(|c| !active.contains(c))
                .cloned()
                .collect(),
            ..Default::default()
        };

        for slot in 0..SLOT_COUNT {
            let start = slot * SLOT_CAPACITY;
            let members: HashSet<String> = active
                .iter()
                .skip(start)
                .take(SLOT_CAPACITY)
                .cloned()
                .collect();

            let old = &self.slot_members[slot];
            plan.register[slot] = members.difference(old).cloned().collect();
            plan.unregister[slot] = old.difference(&members).cloned().collect();
            plan.register[slot].sort();
            plan.unregister[slot].sort();
            self.slot_members[slot] = members;
        }

        plan
    }

    /// Watchlist instruments currently outside both slots (polling targets).
    pub fn unregistered_of(&self, watchlist: &[String]) -> Vec<String> {
        watchlist
            .iter()
            .filter(|c| !self.is_registered(c))
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, code: &str) -> bool {
        self.slot_members.iter().any(|slot| slot.contains(code))
    }

    pub fn registered_count(&self) -> usize {
        self.slot_members.iter().map(HashSet::len).sum()
    }
}

impl Default for SubscriptionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn codes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{:06}", i)).collect()
    }

    #[test]
    fn small_watchlist_fits_in_first_slot() {
        let mut alloc = SubscriptionAllocator::new();
        let wl = codes(5);
        let plan = alloc.plan(&wl);
        assert_eq!(plan.register[0].len(), 5);
        assert!(plan.register[1].is_empty());
        assert!(plan.polling.is_empty());
        assert_eq!(alloc.registered_count(), 5);
    }

    #[test]
    fn overflow_goes_to_polling() {
        let mut alloc = SubscriptionAllocator::new();
        let wl = codes(230);
        let plan = alloc.plan(&wl);
        assert_eq!(plan.register[0].len(), SLOT_CAPACITY);
        assert_eq!(plan.register[1].len(), SLOT_CAPACITY);
        assert_eq!(plan.polling.len(), 30);
        assert_eq!(alloc.unregistered_of(&wl).len(), 30);
    }

    #[test]
    fn holders_always_land_in_active_set() {
        let mut alloc = SubscriptionAllocator::new();
        let wl = codes(200);
        // Holders sit at the very end of the watchlist.
        let holders: Vec<String> = wl[195..].to_vec();
        alloc.set_priority(holders.clone());

        let wl_plus_overflow = codes(250);
        alloc.plan(&wl_plus_overflow);
        for h in &holders {
            assert!(alloc.is_registered(h), "holder {h} fell out of the slots");
        }
    }

    #[test]
    fn replan_emits_only_diffs() {
        let mut alloc = SubscriptionAllocator::new();
        let wl = codes(10);
        let first = alloc.plan(&wl);
        assert_eq!(first.register[0].len(), 10);

        // Same watchlist again: nothing to do.
        let second = alloc.plan(&wl);
        assert!(second.register[0].is_empty());
        assert!(second.unregister[0].is_empty());

        // Drop one instrument, add another.
        let mut wl2 = wl.clone();
        wl2.remove(0);
        wl2.push("999999".to_string());
        let third = alloc.plan(&wl2);
        assert_eq!(third.register[0], vec!["999999".to_string()]);
        assert_eq!(third.unregister[0], vec![wl[0].clone()]);
    }

    #[test]
    fn priority_reorders_slot_assignment() {
        let mut alloc = SubscriptionAllocator::new();
        let wl = codes(150);
        // Make the last instrument a holder: it must land in slot 0.
        alloc.set_priority([wl[149].clone()]);
        let plan = alloc.plan(&wl);
        assert!(plan.register[0].contains(&wl[149]));
    }
}

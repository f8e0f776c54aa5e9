//! Per-reactor timer list.
//!
//! Timers are keyed by absolute deadline on a process-monotonic millisecond
//! clock and fire in deadline order. Expiry handlers may start or cancel
//! other timers, so the firing loop re-checks the list head on every
//! iteration instead of iterating a snapshot.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::time::Instant;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start.
pub fn jiffies() -> u64 {
    START.elapsed().as_millis() as u64
}

/// Handle for canceling a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    deadline: u64,
    seq: u64,
}

pub(crate) struct TimerList {
    // Keyed by (deadline, seq); seq breaks ties while preserving start order.
    entries: BTreeMap<(u64, u64), Box<dyn FnOnce() + Send>>,
    next_seq: u64,
}

impl TimerList {
    pub(crate) fn new() -> TimerList {
        TimerList {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: u64, handler: Box<dyn FnOnce() + Send>) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), handler);
        TimerKey { deadline, seq }
    }

    /// Returns true when the timer was still pending.
    pub(crate) fn cancel(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&(key.deadline, key.seq)).is_some()
    }

    /// Delay until the earliest deadline: `Some(0)` when a timer is already
    /// due (do not block), `None` when the list is empty (wait indefinitely).
    pub(crate) fn next_timeout(&self, now: u64) -> Option<u64> {
        let (&(deadline, _), _) = self.entries.iter().next()?;
        Some(deadline.saturating_sub(now))
    }

    /// Pop the earliest timer if its deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: u64) -> Option<Box<dyn FnOnce() + Send>> {
        let (&(deadline, seq), _) = self.entries.iter().next()?;
        if deadline > now {
            return None;
        }
        self.entries.remove(&(deadline, seq))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn next_timeout_semantics() {
        let mut list = TimerList::new();
        assert_eq!(list.next_timeout(100), None);

        list.insert(150, Box::new(|| {}));
        assert_eq!(list.next_timeout(100), Some(50));
        // Past-due timers must not block the wait.
        assert_eq!(list.next_timeout(200), Some(0));
    }

    #[test]
    fn expiry_is_deadline_ordered() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut list = TimerList::new();

        for deadline in [30u64, 10, 20] {
            let fired = fired.clone();
            list.insert(
                deadline,
                Box::new(move || {
                    // Encode order by the running count at fire time.
                    fired.fetch_add(deadline as usize, Ordering::SeqCst);
                }),
            );
        }

        let mut order = Vec::new();
        let mut last = 0;
        while let Some(handler) = list.pop_expired(100) {
            handler();
            let total = fired.load(Ordering::SeqCst);
            order.push(total - last);
            last = total;
        }
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut list = TimerList::new();
        let key = list.insert(10, Box::new(|| {}));
        assert_eq!(list.len(), 1);
        assert!(list.cancel(key));
        assert!(!list.cancel(key));
        assert_eq!(list.len(), 0);
        assert!(list.pop_expired(u64::MAX).is_none());
    }

    #[test]
    fn equal_deadlines_fire_in_start_order() {
        let mut list = TimerList::new();
        let k1 = list.insert(5, Box::new(|| {}));
        let k2 = list.insert(5, Box::new(|| {}));
        assert_ne!(k1, k2);
        assert!(list.pop_expired(5).is_some());
        assert!(list.pop_expired(5).is_some());
    }
}

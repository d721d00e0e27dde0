//! Scheduled wake-ups owned by the coordinator loop
//!
//! Timers never run on their own task. The loop sleeps until the earliest
//! deadline and then feeds the due `TimerEvent`s through the same handler as
//! radio notifications, which keeps one ordered stream of decisions.

use crate::roaming::event::TimerEvent;
use std::collections::BTreeMap;
use std::time::Instant;

/// Deadline-ordered timer queue; ties fire in scheduling order
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), TimerEvent>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` to fire at `deadline`
    pub fn schedule(&mut self, deadline: Instant, event: TimerEvent) {
        self.seq += 1;
        self.entries.insert((deadline, self.seq), event);
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest timer if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }

    /// Pop the earliest timer regardless of time
    pub fn pop_next(&mut self) -> Option<(Instant, TimerEvent)> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key).map(|event| (key.0, event))
    }

    /// Remove every pending timer matching `predicate`
    pub fn cancel_where(&mut self, predicate: impl Fn(&TimerEvent) -> bool) {
        self.entries.retain(|_, event| !predicate(event));
    }

    pub fn contains(&self, predicate: impl Fn(&TimerEvent) -> bool) -> bool {
        self.entries.values().any(predicate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pops_in_deadline_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.schedule(now + Duration::from_secs(10), TimerEvent::RssiTick);
        q.schedule(now + Duration::from_secs(3), TimerEvent::ScanWindowClosed { window_id: 1 });
        q.schedule(now + Duration::from_secs(30), TimerEvent::ScanCycle);

        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(3)));
        assert_eq!(q.pop_due(now), None);
        assert_eq!(
            q.pop_due(now + Duration::from_secs(5)),
            Some(TimerEvent::ScanWindowClosed { window_id: 1 })
        );
        assert_eq!(q.pop_next().map(|(_, e)| e), Some(TimerEvent::RssiTick));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut q = TimerQueue::new();
        let at = Instant::now();
        q.schedule(at, TimerEvent::ScanCycle);
        q.schedule(at, TimerEvent::RssiTick);
        assert_eq!(q.pop_due(at), Some(TimerEvent::ScanCycle));
        assert_eq!(q.pop_due(at), Some(TimerEvent::RssiTick));
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancel_where() {
        let mut q = TimerQueue::new();
        let at = Instant::now();
        q.schedule(at, TimerEvent::ScanCycle);
        q.schedule(at, TimerEvent::ScanWindowClosed { window_id: 4 });
        q.cancel_where(|e| matches!(e, TimerEvent::ScanWindowClosed { .. }));
        assert!(!q.contains(|e| matches!(e, TimerEvent::ScanWindowClosed { .. })));
        assert_eq!(q.len(), 1);
    }
}

//! A small queue of events due at future host times.
//!
//! Waits in the experiment (overlay delays, pauses between trials) are
//! scheduled here and fired from the same tick that samples the sensors,
//! so nothing ever blocks.

use crate::Seconds;
use std::collections::VecDeque;

/// Events ordered by due time; events due at the same time keep the order
/// they were scheduled in.
#[derive(Debug, Clone)]
pub struct Timeline<E> {
    pending: VecDeque<(Seconds, E)>,
}

impl<E> Default for Timeline<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Timeline<E> {
    /// An empty timeline.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Schedules `event` to fire at `due_s`.
    pub fn schedule(&mut self, due_s: Seconds, event: E) {
        let idx = self
            .pending
            .iter()
            .position(|(t, _)| *t > due_s)
            .unwrap_or(self.pending.len());
        self.pending.insert(idx, (due_s, event));
    }

    /// Removes and returns every event due at or before `now_s`.
    pub fn drain_due(&mut self, now_s: Seconds) -> Vec<E> {
        let n_due = self
            .pending
            .iter()
            .take_while(|(t, _)| *t <= now_s)
            .count();
        self.pending.drain(..n_due).map(|(_, e)| e).collect()
    }

    /// Due time of the next event, if any.
    pub fn next_due(&self) -> Option<Seconds> {
        self.pending.front().map(|(t, _)| *t)
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of scheduled events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_due_order() {
        let mut tl = Timeline::new();
        tl.schedule(3.0, "c");
        tl.schedule(1.0, "a");
        tl.schedule(2.0, "b");
        assert_eq!(tl.next_due(), Some(1.0));

        assert!(tl.drain_due(0.5).is_empty());
        assert_eq!(tl.drain_due(2.0), vec!["a", "b"]);
        assert_eq!(tl.len(), 1);
        assert_eq!(tl.drain_due(10.0), vec!["c"]);
        assert!(tl.is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut tl = Timeline::new();
        tl.schedule(1.0, 1);
        tl.schedule(1.0, 2);
        tl.schedule(0.5, 0);
        tl.schedule(1.0, 3);
        assert_eq!(tl.drain_due(1.0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_clear() {
        let mut tl = Timeline::new();
        tl.schedule(1.0, ());
        tl.clear();
        assert!(tl.drain_due(5.0).is_empty());
    }
}

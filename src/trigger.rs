//! Edge detection for externally paced runs.
//!
//! In externally triggered mode an outside collaborator (GUI, foot
//! pedal service, lab automation) owns pacing. It exposes two polled
//! signals: a run flag and a monotonically increasing advance counter.
//! The detector turns successive polls of those signals into discrete
//! events, each consumed exactly once, so a slow poll that misses
//! several counter increments still advances the right number of steps.

/// One discrete pacing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// The run flag rose.
    RunStarted,
    /// The run flag fell.
    RunStopped,
    /// The advance counter incremented (one event per increment).
    Advance,
}

/// Stateful detector over polled {run flag, advance counter} signals.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    last_run: bool,
    last_counter: Option<u64>,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare a new observation against the previous one and return the
    /// events that happened in between, in order: run edge first, then
    /// one advance per counter increment.
    ///
    /// The first observation establishes the counter baseline without
    /// emitting advances, so a collaborator whose counter already reads N
    /// when polling begins does not replay N stale advances. A counter
    /// that moved backwards is treated as a collaborator restart: the new
    /// value is adopted without emitting events.
    pub fn observe(&mut self, run: bool, counter: u64) -> Vec<TriggerEvent> {
        let mut events = Vec::new();
        if run != self.last_run {
            events.push(if run {
                TriggerEvent::RunStarted
            } else {
                TriggerEvent::RunStopped
            });
            self.last_run = run;
        }
        if let Some(last) = self.last_counter {
            if counter >= last {
                for _ in last..counter {
                    events.push(TriggerEvent::Advance);
                }
            }
        }
        self.last_counter = Some(counter);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_signals_emit_nothing() {
        let mut d = EdgeDetector::new();
        assert!(d.observe(false, 0).is_empty());
        assert!(d.observe(false, 0).is_empty());
    }

    #[test]
    fn test_run_edges() {
        let mut d = EdgeDetector::new();
        assert_eq!(d.observe(true, 0), vec![TriggerEvent::RunStarted]);
        assert!(d.observe(true, 0).is_empty());
        assert_eq!(d.observe(false, 0), vec![TriggerEvent::RunStopped]);
    }

    #[test]
    fn test_each_increment_consumed_once() {
        let mut d = EdgeDetector::new();
        d.observe(true, 0);
        assert_eq!(d.observe(true, 1), vec![TriggerEvent::Advance]);
        assert!(d.observe(true, 1).is_empty());
    }

    #[test]
    fn test_missed_polls_yield_all_advances() {
        let mut d = EdgeDetector::new();
        d.observe(true, 0);
        assert_eq!(
            d.observe(true, 3),
            vec![
                TriggerEvent::Advance,
                TriggerEvent::Advance,
                TriggerEvent::Advance
            ]
        );
    }

    #[test]
    fn test_simultaneous_edge_and_advance_orders_run_first() {
        let mut d = EdgeDetector::new();
        d.observe(false, 0);
        assert_eq!(
            d.observe(true, 2),
            vec![
                TriggerEvent::RunStarted,
                TriggerEvent::Advance,
                TriggerEvent::Advance
            ]
        );
    }

    #[test]
    fn test_first_observation_sets_baseline_without_advances() {
        // Collaborator counter already at 7 when polling begins.
        let mut d = EdgeDetector::new();
        assert_eq!(d.observe(true, 7), vec![TriggerEvent::RunStarted]);
        assert_eq!(d.observe(true, 8), vec![TriggerEvent::Advance]);
    }

    #[test]
    fn test_counter_reset_adopted_silently() {
        let mut d = EdgeDetector::new();
        d.observe(true, 5);
        assert!(d.observe(true, 1).is_empty());
        assert_eq!(d.observe(true, 2), vec![TriggerEvent::Advance]);
    }
}

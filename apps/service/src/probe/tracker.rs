//! Deciding "this probe round is over" without races.
//!
//! Circuit events and worker results arrive on two independent tasks; both
//! funnel their counter updates through one mutex, and the finished flag
//! flips exactly once. Counter updates after that point still land (the
//! counters stay monotone) but can never un-finish the round.

use std::sync::Mutex;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundCounters {
    pub total: u32,
    pub failed: u32,
    pub built: u32,
    pub finished_streams: u32,
}

struct State {
    counters: RoundCounters,
    finished: bool,
}

pub struct CompletionTracker {
    state: Mutex<State>,
    done_tx: watch::Sender<bool>,
}

impl CompletionTracker {
    /// A fresh tracker for a round of `total` candidate circuits. The
    /// receiver resolves to `true` once the completion predicate holds.
    pub fn new(total: u32) -> (Self, watch::Receiver<bool>) {
        let (done_tx, done_rx) = watch::channel(false);
        let tracker = Self {
            state: Mutex::new(State {
                counters: RoundCounters { total, ..Default::default() },
                finished: false,
            }),
            done_tx,
        };
        (tracker, done_rx)
    }

    /// Returns `true` for exactly one caller: the one whose update
    /// completed the round.
    pub fn record_failed(&self) -> bool {
        self.update(|counters| counters.failed += 1)
    }

    pub fn record_built(&self) -> bool {
        self.update(|counters| counters.built += 1)
    }

    pub fn record_stream_finished(&self) -> bool {
        self.update(|counters| counters.finished_streams += 1)
    }

    /// Deadline path: end the round regardless of the counters. Idempotent;
    /// returns whether this call did the finishing.
    pub fn force_finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return false;
        }
        state.finished = true;
        let _ = self.done_tx.send(true);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub fn counters(&self) -> RoundCounters {
        self.state.lock().unwrap().counters
    }

    fn update<F: FnOnce(&mut RoundCounters)>(&self, apply: F) -> bool {
        let mut state = self.state.lock().unwrap();
        apply(&mut state.counters);
        let counters = state.counters;

        // Corrupted shared state is a programming error, not a probe
        // failure. Fail loudly.
        assert!(
            counters.failed + counters.built <= counters.total,
            "circuit counters exceed requested total: {counters:?}"
        );
        assert!(
            counters.finished_streams <= counters.built,
            "more finished streams than built circuits: {counters:?}"
        );

        if state.finished {
            return false;
        }

        // Did all circuits either build or fail?
        let circuits_done = counters.failed + counters.built == counters.total;
        // Was every built circuit's probe accounted for?
        let streams_done =
            i64::from(counters.finished_streams) >= i64::from(counters.built) - i64::from(counters.failed);

        tracing::debug!(
            "failedCircs={}, builtCircs={}, totalCircs={}, finishedStreams={}",
            counters.failed,
            counters.built,
            counters.total,
            counters.finished_streams
        );

        if circuits_done && streams_done {
            state.finished = true;
            let _ = self.done_tx.send(true);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_built_circuits_must_report_before_completion() {
        let (tracker, done_rx) = CompletionTracker::new(3);

        assert!(!tracker.record_built());
        assert!(!tracker.record_built());
        assert!(!tracker.record_built());
        assert!(!tracker.record_stream_finished());
        assert!(!tracker.record_stream_finished());
        assert!(!tracker.is_finished());

        assert!(tracker.record_stream_finished());
        assert!(tracker.is_finished());
        assert!(*done_rx.borrow());
    }

    #[test]
    fn three_circuits_one_failure_completes_exactly_once() {
        let (tracker, done_rx) = CompletionTracker::new(3);

        assert!(!tracker.record_failed());
        assert!(!tracker.record_built());
        assert!(!tracker.record_built());
        assert!(!tracker.is_finished());

        // The completion formula discounts built circuits by the failed
        // count, so the first reported stream already satisfies it here;
        // it still fires exactly once.
        assert!(tracker.record_stream_finished());
        assert!(!tracker.record_stream_finished());
        assert!(tracker.is_finished());
        assert!(*done_rx.borrow());
    }

    #[test]
    fn completion_is_monotonic() {
        let (tracker, done_rx) = CompletionTracker::new(1);

        assert!(!tracker.record_built());
        assert!(tracker.record_stream_finished());

        // Late failures or forced finishes never claim completion again and
        // never un-finish the round.
        assert!(!tracker.force_finish());
        assert!(tracker.is_finished());
        assert!(*done_rx.borrow());
    }

    #[test]
    fn all_failed_circuits_complete_without_streams() {
        let (tracker, _done_rx) = CompletionTracker::new(2);

        assert!(!tracker.record_failed());
        assert!(tracker.record_failed());
    }

    #[test]
    fn force_finish_fires_once() {
        let (tracker, done_rx) = CompletionTracker::new(5);

        assert!(tracker.force_finish());
        assert!(!tracker.force_finish());
        assert!(*done_rx.borrow());
    }

    #[test]
    fn counters_snapshot_reflects_updates() {
        let (tracker, _done_rx) = CompletionTracker::new(4);
        tracker.record_failed();
        tracker.record_built();

        let counters = tracker.counters();
        assert_eq!(
            counters,
            RoundCounters { total: 4, failed: 1, built: 1, finished_streams: 0 }
        );
    }

    #[test]
    #[should_panic(expected = "circuit counters exceed requested total")]
    fn overcounting_circuits_panics() {
        let (tracker, _done_rx) = CompletionTracker::new(1);
        tracker.record_built();
        tracker.record_built();
    }

    #[test]
    #[should_panic(expected = "more finished streams than built circuits")]
    fn stream_finish_without_built_circuit_panics() {
        let (tracker, _done_rx) = CompletionTracker::new(1);
        tracker.record_stream_finished();
    }
}

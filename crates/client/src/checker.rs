// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Slow-consumer checker - publisher-side admission control.
//!
//! Bounds how many segments may be in flight between a producer and its
//! publish peers, independently of TCP backpressure. A publish that is
//! still running once a newer seq has started is stale and should abort
//! rather than block the head of the line.

use std::sync::{Mutex, MutexGuard};

/// Default bound on concurrently in-flight segments.
pub const DEFAULT_MAX_INFLIGHT: u64 = 3;

struct CheckerState {
    started: u64,
    completed: u64,
    newest_seq: Option<i64>,
}

/// Counter pair guarding segment starts.
pub struct SlowConsumerChecker {
    max_inflight: u64,
    state: Mutex<CheckerState>,
}

impl Default for SlowConsumerChecker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INFLIGHT)
    }
}

impl SlowConsumerChecker {
    pub fn new(max_inflight: u64) -> Self {
        Self {
            max_inflight: max_inflight.max(1),
            state: Mutex::new(CheckerState { started: 0, completed: 0, newest_seq: None }),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, CheckerState>> {
        self.state.lock().ok()
    }

    /// Try to start a segment. Returns `false` (without counting the start)
    /// when the in-flight bound is already met.
    pub fn begin_segment(&self, seq: i64) -> bool {
        let Some(mut state) = self.lock() else { return false };
        if state.started - state.completed >= self.max_inflight {
            tracing::warn!(
                seq,
                in_flight = state.started - state.completed,
                "refusing segment start, too many in flight"
            );
            return false;
        }
        state.started += 1;
        if state.newest_seq.is_none_or(|newest| seq > newest) {
            state.newest_seq = Some(seq);
        }
        true
    }

    /// Complete a previously started segment.
    pub fn end_segment(&self) {
        if let Some(mut state) = self.lock() {
            if state.completed < state.started {
                state.completed += 1;
            }
        }
    }

    /// Whether a newer seq has started since this one; a stale publish
    /// should abort itself instead of blocking behind a stuck peer.
    pub fn is_stale(&self, seq: i64) -> bool {
        self.lock()
            .is_some_and(|state| state.newest_seq.is_some_and(|newest| newest > seq))
    }

    pub fn in_flight(&self) -> u64 {
        self.lock().map(|state| state.started - state.completed).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fourth_start_is_refused_without_counting() {
        let checker = SlowConsumerChecker::new(3);
        assert!(checker.begin_segment(0));
        assert!(checker.begin_segment(1));
        assert!(checker.begin_segment(2));

        assert!(!checker.begin_segment(3));
        assert_eq!(checker.in_flight(), 3);

        checker.end_segment();
        assert!(checker.begin_segment(3));
        assert_eq!(checker.in_flight(), 3);
    }

    #[test]
    fn stalled_segment_becomes_stale_once_newer_starts() {
        let checker = SlowConsumerChecker::new(3);
        assert!(checker.begin_segment(5));
        assert!(!checker.is_stale(5));

        assert!(checker.begin_segment(6));
        assert!(checker.is_stale(5));
        assert!(!checker.is_stale(6));
    }

    #[test]
    fn end_without_begin_does_not_underflow() {
        let checker = SlowConsumerChecker::new(1);
        checker.end_segment();
        assert_eq!(checker.in_flight(), 0);
        assert!(checker.begin_segment(0));
        assert!(!checker.begin_segment(1));
    }
}

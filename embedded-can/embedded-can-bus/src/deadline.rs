//! Submission-to-wire deadline bookkeeping.
//!
//! A [`QueuedCanBus`](crate::QueuedCanBus) decouples "accepted by the sender" from "placed on
//! the wire", so a per-frame timer such as ISO-TP's N_As has to span several outstanding frames.
//! [`DeadlineTracker`] records a ticket per submitted unit and reports how long the oldest
//! outstanding one still has before it breaches the configured duration.

use core::time::Duration;
use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Identity of one tracked submission. Tickets increase monotonically per tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct TrackerState {
    next: u64,
    outstanding: BTreeMap<u64, Instant>,
    max_latency: Duration,
}

/// Sliding window of outstanding submissions against a fixed duration.
#[derive(Debug)]
pub struct DeadlineTracker {
    limit: Duration,
    state: Mutex<TrackerState>,
}

impl DeadlineTracker {
    /// Track submissions against `limit`.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// The configured duration.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Record a submission now and return its ticket.
    pub fn enqueue(&self) -> Ticket {
        let mut state = self.state.lock();
        let ticket = state.next;
        state.next += 1;
        state.outstanding.insert(ticket, Instant::now());
        Ticket(ticket)
    }

    /// Mark a submission as placed on the wire.
    ///
    /// Returns the observed submission-to-wire latency, or `None` for an unknown ticket.
    pub fn dequeue(&self, ticket: Ticket) -> Option<Duration> {
        let mut state = self.state.lock();
        let submitted = state.outstanding.remove(&ticket.0)?;
        let latency = submitted.elapsed();
        if latency > state.max_latency {
            state.max_latency = latency;
        }
        Some(latency)
    }

    /// Time left before the oldest outstanding submission breaches the limit.
    ///
    /// With nothing outstanding the full limit is available.
    pub fn remaining(&self) -> Duration {
        let state = self.state.lock();
        match state.outstanding.values().next() {
            Some(oldest) => self.limit.saturating_sub(oldest.elapsed()),
            None => self.limit,
        }
    }

    /// Instant at which the oldest outstanding submission breaches the limit.
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .outstanding
            .values()
            .next()
            .map(|oldest| *oldest + self.limit)
    }

    /// True once the oldest outstanding submission has exceeded the limit.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.lock();
        state
            .outstanding
            .values()
            .next()
            .is_some_and(|oldest| oldest.elapsed() >= self.limit)
    }

    /// Number of submissions not yet dequeued.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Largest latency observed by [`DeadlineTracker::dequeue`].
    pub fn max_latency(&self) -> Duration {
        self.state.lock().max_latency
    }

    /// Forget every outstanding submission.
    pub fn clear(&self) {
        self.state.lock().outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_tracks_oldest_ticket() {
        let tracker = DeadlineTracker::new(Duration::from_millis(100));
        assert_eq!(tracker.remaining(), Duration::from_millis(100));

        let first = tracker.enqueue();
        tokio::time::advance(Duration::from_millis(30)).await;
        let second = tracker.enqueue();
        assert_eq!(tracker.remaining(), Duration::from_millis(70));

        assert_eq!(tracker.dequeue(first), Some(Duration::from_millis(30)));
        assert_eq!(tracker.remaining(), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(tracker.is_timed_out());
        assert_eq!(tracker.remaining(), Duration::ZERO);
        tracker.dequeue(second);
        assert!(!tracker.is_timed_out());
        assert_eq!(tracker.max_latency(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_submissions_get_distinct_tickets() {
        let tracker = DeadlineTracker::new(Duration::from_millis(50));
        let a = tracker.enqueue();
        let b = tracker.enqueue();
        assert_ne!(a, b);
        assert_eq!(tracker.outstanding(), 2);
        tracker.dequeue(a);
        assert_eq!(tracker.outstanding(), 1);
        assert!(tracker.dequeue(a).is_none());
        tracker.clear();
        assert_eq!(tracker.outstanding(), 0);
        assert!(tracker.deadline().is_none());
    }
}

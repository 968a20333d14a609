//! Bounded offline queue for envelopes produced while the channel is down.
//!
//! The outbox is a ring: pushing onto a full queue drops the oldest entry.
//! Entries remember when they were queued so that a flush after a long
//! outage can discard messages nobody wants anymore instead of replaying
//! a stale burst.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use fg_protocol::Envelope;

/// One queued, not-yet-signed envelope.
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub queued_at: DateTime<Utc>,
}

/// Bounded FIFO of envelopes awaiting a live connection.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    entries: VecDeque<QueuedEnvelope>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Queue an envelope. Returns the envelope evicted to make room, if the
    /// ring was full.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        self.push_at(envelope, Utc::now())
    }

    pub fn push_at(&mut self, envelope: Envelope, now: DateTime<Utc>) -> Option<Envelope> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|q| q.envelope)
        } else {
            None
        };
        self.entries.push_back(QueuedEnvelope {
            envelope,
            queued_at: now,
        });
        evicted
    }

    /// Drain the queue oldest-first, discarding entries that have been
    /// waiting longer than `max_age`. Returns the envelopes still worth
    /// sending, in queue order.
    pub fn drain_fresh(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<Envelope> {
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut fresh = Vec::new();
        let mut expired = 0usize;
        for queued in self.entries.drain(..) {
            if queued.queued_at < cutoff {
                expired += 1;
            } else {
                fresh.push(queued.envelope);
            }
        }
        if expired > 0 {
            tracing::debug!(expired, "dropped expired outbox entries at flush");
        }
        fresh
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
    use fg_protocol::EnvelopeKind;

    fn env(tag: &str) -> Envelope {
        Envelope::new(
            EnvelopeKind::BehavioralSignal,
            serde_json::json!({ "tag": tag }),
            "sess-1",
            "http://localhost:3000",
        )
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut outbox = Outbox::new(2);
        assert!(outbox.push(env("a")).is_none());
        assert!(outbox.push(env("b")).is_none());
        let evicted = outbox.push(env("c")).unwrap();
        assert_eq!(evicted.payload["tag"], "a");
        assert_eq!(outbox.len(), 2);

        let flushed = outbox.drain_fresh(Utc::now(), Duration::from_secs(60));
        let tags: Vec<_> = flushed.iter().map(|e| e.payload["tag"].clone()).collect();
        assert_eq!(tags, vec!["b", "c"]);
    }

    #[test]
    fn flush_preserves_queue_order() {
        let mut outbox = Outbox::new(8);
        for tag in ["1", "2", "3"] {
            outbox.push(env(tag));
        }
        let flushed = outbox.drain_fresh(Utc::now(), Duration::from_secs(60));
        let tags: Vec<_> = flushed.iter().map(|e| e.payload["tag"].clone()).collect();
        assert_eq!(tags, vec!["1", "2", "3"]);
    }

    #[test]
    fn stale_entries_dropped_at_flush() {
        let t0 = Utc::now();
        let mut outbox = Outbox::new(8);
        outbox.push_at(env("old"), t0 - chrono::Duration::seconds(120));
        outbox.push_at(env("fresh"), t0 - chrono::Duration::seconds(5));

        let flushed = outbox.drain_fresh(t0, Duration::from_secs(30));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload["tag"], "fresh");
        assert!(outbox.is_empty());
    }
}

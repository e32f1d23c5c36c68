//! Ordered, sequenced buffer of live stream events.
//!
//! This module provides the append-only event buffer a streaming client
//! exposes to its consumers:
//! - Arrival-order sequence numbers for cursor-based reads
//! - Dedup of history the server replays on every (re)connect
//! - Bounded memory with oldest-event eviction

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use runlens_types::StreamMessage;

/// Default maximum number of buffered events.
pub const DEFAULT_MAX_EVENTS: usize = 50_000;

/// One event with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    /// Monotonically increasing sequence number
    pub seq: u64,
    /// Which connection (1-based) delivered the event
    pub connection: u32,
    /// Receive time (ms since Unix epoch)
    pub received_at: u64,
    pub message: StreamMessage,
}

/// Result of offering a message to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { seq: u64, evicted: usize },
    /// Dropped as a replay of an already buffered line.
    Duplicate,
}

/// Append-only log of stream events in arrival order.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SequencedEvent>,
    /// Sequence number of oldest event (or next_seq if empty)
    start_seq: u64,
    next_seq: u64,
    max_events: usize,
    /// Highest server line number buffered so far
    high_water_line: u64,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            start_seq: 0,
            next_seq: 0,
            max_events: max_events.max(1),
            high_water_line: 0,
        }
    }

    /// Append a message received on `connection`.
    pub fn append(&mut self, connection: u32, message: StreamMessage) -> AppendOutcome {
        if let Some(line_num) = message.line_num() {
            if line_num <= self.high_water_line {
                return AppendOutcome::Duplicate;
            }
            self.high_water_line = line_num;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let received_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        self.events.push_back(SequencedEvent {
            seq,
            connection,
            received_at,
            message,
        });

        let mut evicted = 0;
        while self.events.len() > self.max_events {
            self.events.pop_front();
            evicted += 1;
        }
        self.start_seq = self.events.front().map(|e| e.seq).unwrap_or(self.next_seq);

        AppendOutcome::Appended { seq, evicted }
    }

    /// Events with `seq >= from`, in order.
    pub fn since(&self, from: u64) -> Vec<SequencedEvent> {
        let skip = from.saturating_sub(self.start_seq) as usize;
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequencedEvent> {
        self.events.iter()
    }

    /// Oldest available sequence number.
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    /// Sequence number the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn has_seq(&self, seq: u64) -> bool {
        seq >= self.start_seq && seq < self.next_seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop all events. Sequence numbers stay monotonic.
    pub fn clear(&mut self) {
        self.events.clear();
        self.start_seq = self.next_seq;
        self.high_water_line = 0;
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlens_types::OutputLine;

    fn output(line_num: Option<u64>) -> StreamMessage {
        StreamMessage::Output(OutputLine {
            line: format!("line {:?}", line_num),
            timestamp: None,
            line_num,
        })
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let mut log = EventLog::default();
        assert_eq!(log.append(1, output(Some(1))), AppendOutcome::Appended { seq: 0, evicted: 0 });
        assert_eq!(log.append(1, output(Some(2))), AppendOutcome::Appended { seq: 1, evicted: 0 });
        assert_eq!(log.next_seq(), 2);
        assert_eq!(log.since(1).len(), 1);
        assert_eq!(log.since(0)[0].seq, 0);
    }

    #[test]
    fn test_replayed_history_is_dropped() {
        let mut log = EventLog::default();
        for n in 1..=3 {
            log.append(1, output(Some(n)));
        }
        // Reconnect: server replays 1..=3, then continues with 4.
        for n in 1..=3 {
            assert_eq!(log.append(2, output(Some(n))), AppendOutcome::Duplicate);
        }
        assert!(matches!(log.append(2, output(Some(4))), AppendOutcome::Appended { seq: 3, .. }));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_unnumbered_events_always_append() {
        let mut log = EventLog::default();
        log.append(1, output(None));
        log.append(1, output(None));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_eviction_keeps_sequence() {
        let mut log = EventLog::new(2);
        log.append(1, output(Some(1)));
        log.append(1, output(Some(2)));
        assert_eq!(log.append(1, output(Some(3))), AppendOutcome::Appended { seq: 2, evicted: 1 });
        assert_eq!(log.start_seq(), 1);
        assert!(!log.has_seq(0));
        assert!(log.has_seq(2));
        // A cursor behind the window gets what is still available.
        assert_eq!(log.since(0).len(), 2);
    }

    #[test]
    fn test_clear_preserves_monotonicity() {
        let mut log = EventLog::default();
        log.append(1, output(Some(1)));
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.start_seq(), 1);
        assert!(matches!(log.append(1, output(Some(1))), AppendOutcome::Appended { seq: 1, .. }));
    }
}

//! Feeder: pacing queue for interactive commands
//!
//! Ad-hoc lines (jog moves, manual G-code, macros) from any origin are
//! queued here and handed to the controller strictly one at a time. The
//! controller calls [`Feeder::next`] once to start dispatch and again on
//! each device acknowledgement; a line is in flight between those two
//! calls.

use crate::connection::ClientId;
use cncbridge_core::FeederStatus;
use std::collections::VecDeque;

/// A queued interactive line, tagged with its originating client (if any)
/// so the controller can correlate the device echo.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    /// The client that issued the line, when it came over a connection
    pub client: Option<ClientId>,
    /// The G-code line (no terminator)
    pub line: String,
}

impl FeedItem {
    /// Create an item with no originating client
    pub fn anonymous(line: impl Into<String>) -> Self {
        Self {
            client: None,
            line: line.into(),
        }
    }

    /// Create an item tagged with its originating client
    pub fn from_client(client: ClientId, line: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            line: line.into(),
        }
    }
}

/// Ordered queue of interactive lines with one-at-a-time dispatch
#[derive(Debug, Default)]
pub struct Feeder {
    queue: VecDeque<FeedItem>,
    pending: bool,
    changed: bool,
}

impl Feeder {
    /// Create an empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the queue
    pub fn feed(&mut self, item: FeedItem) {
        self.queue.push_back(item);
        self.changed = true;
    }

    /// Advance the queue
    ///
    /// A second call acts as the acknowledgement for the line returned by
    /// the first: the pending flag is cleared, then the next queued item
    /// (if any) is popped, marked pending, and returned. Returns `None`
    /// when the queue is empty.
    pub fn next(&mut self) -> Option<FeedItem> {
        if self.pending {
            self.pending = false;
            self.changed = true;
        }
        let item = self.queue.pop_front()?;
        self.pending = true;
        self.changed = true;
        Some(item)
    }

    /// Drop all queued items; the pending flag is unchanged
    pub fn clear(&mut self) {
        if !self.queue.is_empty() {
            self.queue.clear();
            self.changed = true;
        }
    }

    /// True while a line is in flight awaiting its acknowledgement
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Number of queued items (not counting the in-flight line)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True when the queue has changed since the last peek
    ///
    /// Drives `feeder:status` publication at timer granularity.
    pub fn peek(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Snapshot for publication to clients
    pub fn status(&self) -> FeederStatus {
        FeederStatus {
            queued: self.queue.len(),
            pending: self.pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_line_in_flight() {
        let mut feeder = Feeder::new();
        feeder.feed(FeedItem::anonymous("G0 X0"));
        feeder.feed(FeedItem::anonymous("G0 X1"));

        let first = feeder.next().unwrap();
        assert_eq!(first.line, "G0 X0");
        assert!(feeder.is_pending());
        assert_eq!(feeder.len(), 1);

        // The next call acknowledges the first line and emits the second
        let second = feeder.next().unwrap();
        assert_eq!(second.line, "G0 X1");
        assert!(feeder.is_pending());

        // Final acknowledgement drains the pending flag
        assert!(feeder.next().is_none());
        assert!(!feeder.is_pending());
    }

    #[test]
    fn test_next_on_empty_queue() {
        let mut feeder = Feeder::new();
        assert!(feeder.next().is_none());
        assert!(!feeder.is_pending());
    }

    #[test]
    fn test_clear_keeps_pending() {
        let mut feeder = Feeder::new();
        feeder.feed(FeedItem::anonymous("G0 X0"));
        feeder.feed(FeedItem::anonymous("G0 X1"));
        feeder.next();

        feeder.clear();
        assert!(feeder.is_empty());
        assert!(feeder.is_pending());
    }

    #[test]
    fn test_peek_reports_change_once() {
        let mut feeder = Feeder::new();
        assert!(!feeder.peek());

        feeder.feed(FeedItem::anonymous("G0 X0"));
        assert!(feeder.peek());
        assert!(!feeder.peek());

        feeder.next();
        assert!(feeder.peek());
    }

    #[test]
    fn test_client_tag_survives() {
        let mut feeder = Feeder::new();
        let client = ClientId::new();
        feeder.feed(FeedItem::from_client(client, "$X"));

        let item = feeder.next().unwrap();
        assert_eq!(item.client, Some(client));
    }

    #[test]
    fn test_status_snapshot() {
        let mut feeder = Feeder::new();
        feeder.feed(FeedItem::anonymous("G0"));
        feeder.feed(FeedItem::anonymous("G1"));
        feeder.next();

        let status = feeder.status();
        assert_eq!(status.queued, 1);
        assert!(status.pending);
    }
}

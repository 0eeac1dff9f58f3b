// ==============================================================================
// reorder.rs - Sequence-Ordered Reorder Buffer
// ==============================================================================
// Description: Reconciles out-of-order parallel fetch completions into
//              strict sequence order for the single writer
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::error::ExportError;

/// Sequence-indexed holding area. Fetch workers insert completed chunks in
/// any order; exactly one consumer removes them in strictly increasing,
/// gapless sequence order.
///
/// Insertions are signaled through a `Notify` instead of the source's
/// polling sleeps; the consumer still bounds each wait externally so the
/// cooperative abort flag is observed within one polling interval.
#[derive(Debug, Default)]
pub struct ReorderBuffer<T> {
    entries: Mutex<BTreeMap<u64, T>>,
    inserted: Notify,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            inserted: Notify::new(),
        }
    }

    /// Insert a completed chunk under its sequence number.
    /// Two chunks may never share a sequence number.
    pub fn insert(&self, sequence: u64, item: T) -> Result<(), ExportError> {
        {
            let mut entries = self.entries.lock().expect("reorder buffer poisoned");
            if entries.insert(sequence, item).is_some() {
                return Err(ExportError::DuplicateSequence(sequence));
            }
        }
        self.inserted.notify_waiters();
        Ok(())
    }

    /// Number of completed-but-unwritten chunks currently held.
    /// Feeds the concurrency controller's backlog gate.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("reorder buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the chunk for `expected` if it is present
    pub fn try_take(&self, expected: u64) -> Option<T> {
        self.entries
            .lock()
            .expect("reorder buffer poisoned")
            .remove(&expected)
    }

    /// Wait until the chunk for `expected` arrives, then remove it.
    /// At most one consumer may call this.
    pub async fn take_next(&self, expected: u64) -> T {
        loop {
            // Register for the wakeup before checking, so an insert between
            // the check and the await is not lost
            let notified = self.inserted.notified();
            if let Some(item) = self.try_take(expected) {
                return item;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_out_of_order_inserts_release_in_order() {
        let buffer: ReorderBuffer<&str> = ReorderBuffer::new();
        buffer.insert(2, "third").unwrap();
        buffer.insert(0, "first").unwrap();
        buffer.insert(1, "second").unwrap();
        assert_eq!(buffer.len(), 3);

        assert_eq!(buffer.try_take(0), Some("first"));
        assert_eq!(buffer.try_take(1), Some("second"));
        assert_eq!(buffer.try_take(2), Some("third"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_gap_blocks_consumption() {
        let buffer: ReorderBuffer<u32> = ReorderBuffer::new();
        buffer.insert(1, 11).unwrap();
        // Sequence 0 has not arrived: nothing to take yet
        assert_eq!(buffer.try_take(0), None);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let buffer: ReorderBuffer<u32> = ReorderBuffer::new();
        buffer.insert(4, 1).unwrap();
        let err = buffer.insert(4, 2).unwrap_err();
        assert!(matches!(err, ExportError::DuplicateSequence(4)));
    }

    #[tokio::test]
    async fn test_take_next_waits_for_arrival() {
        let buffer: Arc<ReorderBuffer<&str>> = Arc::new(ReorderBuffer::new());

        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let a = buffer.take_next(0).await;
                let b = buffer.take_next(1).await;
                (a, b)
            })
        };

        // Deliver out of order after a short delay
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.insert(1, "second").unwrap();
        buffer.insert(0, "first").unwrap();

        let (a, b) = consumer.await.unwrap();
        assert_eq!(a, "first");
        assert_eq!(b, "second");
    }
}

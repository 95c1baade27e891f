//! Restores ascending sequence order over out-of-order deliveries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Pending<T> {
    sequence: u32,
    item: T,
}

impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.sequence.cmp(&self.sequence)
    }
}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<T> Eq for Pending<T> {}

/// Min-heap of pending items plus the next sequence allowed through.
pub struct SequenceRestorer<T> {
    expected: u32,
    pending: BinaryHeap<Pending<T>>,
}

impl<T> SequenceRestorer<T> {
    pub fn new(first: u32) -> Self {
        Self {
            expected: first,
            pending: BinaryHeap::new(),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept `item` and return every item now deliverable, in order.
    ///
    /// An item older than the expected sequence has nothing to wait for and
    /// is released immediately.
    pub fn push(&mut self, sequence: u32, item: T) -> Vec<T> {
        if sequence < self.expected {
            tracing::warn!(
                sequence,
                expected = self.expected,
                "Late delivery released out of order"
            );
            return vec![item];
        }

        self.pending.push(Pending { sequence, item });

        let mut ready = Vec::new();
        while let Some(top) = self.pending.peek() {
            if top.sequence > self.expected {
                break;
            }
            let advance = top.sequence == self.expected;
            if let Some(next) = self.pending.pop() {
                ready.push(next.item);
            }
            if advance {
                self.expected = self.expected.wrapping_add(1);
            }
        }
        ready
    }

    /// Drop pending items and restart at `next`. Returns the dropped count.
    pub fn reset(&mut self, next: u32) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.expected = next;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn deliver_all(order: &[u32]) -> Vec<u32> {
        let mut restorer = SequenceRestorer::new(0);
        order
            .iter()
            .flat_map(|&seq| restorer.push(seq, seq))
            .collect()
    }

    #[test]
    fn test_holds_until_gap_filled() {
        let mut restorer = SequenceRestorer::new(0);
        assert!(restorer.push(2, 'c').is_empty());
        assert!(restorer.push(1, 'b').is_empty());
        assert_eq!(restorer.pending(), 2);
        assert_eq!(restorer.push(0, 'a'), vec!['a', 'b', 'c']);
        assert_eq!(restorer.expected(), 3);
    }

    #[test]
    fn test_late_item_released_immediately() {
        let mut restorer = SequenceRestorer::new(5);
        assert_eq!(restorer.push(3, 'x'), vec!['x']);
        assert_eq!(restorer.expected(), 5);
    }

    #[test]
    fn test_reset_drops_pending() {
        let mut restorer = SequenceRestorer::new(0);
        restorer.push(4, ());
        restorer.push(6, ());
        assert_eq!(restorer.reset(7), 2);
        assert_eq!(restorer.expected(), 7);
        assert_eq!(restorer.push(7, ()).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_output_order_independent_of_arrival(
            order in Just((0u32..24).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let in_order: Vec<u32> = (0..24).collect();
            prop_assert_eq!(deliver_all(&order), deliver_all(&in_order));
            prop_assert_eq!(deliver_all(&order), in_order);
        }
    }
}

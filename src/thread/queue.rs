//! Input queues registered with a [`WaitHub`].
//!
//! Queues are cheap cloneable handles: the owning handler keeps one clone to
//! push and pop, the hub keeps another (as `Arc<dyn WaitQueue>`) to evaluate
//! readiness. Pushing notifies the attached hub after the queue lock is
//! released, so the lock order is always hub before queue.

use super::WaitHub;
use crate::sync::lock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

/// Payloads carrying a request sequence number.
pub trait Sequenced {
    fn sequence(&self) -> u32;
}

impl<T: Sequenced + ?Sized> Sequenced for Arc<T> {
    fn sequence(&self) -> u32 {
        (**self).sequence()
    }
}

impl Sequenced for u32 {
    fn sequence(&self) -> u32 {
        *self
    }
}

/// The hub's view of a queue.
pub trait WaitQueue: Send + Sync {
    fn name(&self) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence numbers currently queued, in dequeue order.
    fn keys(&self) -> Vec<u32>;

    fn contains_key(&self, key: u32) -> bool;

    /// Drop every queued item, returning how many were dropped.
    fn clear(&self) -> usize;

    fn attach(&self, hub: Weak<WaitHub>);
}

struct Shared<C> {
    name: String,
    items: Mutex<C>,
    hub: Mutex<Weak<WaitHub>>,
}

impl<C> Shared<C> {
    fn new(name: impl Into<String>, items: C) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(items),
            hub: Mutex::new(Weak::new()),
        }
    }

    fn notify(&self) {
        let hub = lock(&self.hub).upgrade();
        if let Some(hub) = hub {
            hub.signal_enque();
        }
    }
}

// ── FIFO ──

/// First-in first-out queue.
pub struct FifoQueue<T> {
    shared: Arc<Shared<VecDeque<T>>>,
}

impl<T> Clone for FifoQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> FifoQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::new(name, VecDeque::new())),
        }
    }

    pub fn enque(&self, item: T) {
        lock(&self.shared.items).push_back(item);
        self.shared.notify();
    }

    pub fn deque(&self) -> Option<T> {
        lock(&self.shared.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Sequenced> FifoQueue<T> {
    /// Remove the first item whose sequence equals `key`.
    pub fn deque_match(&self, key: u32) -> Option<T> {
        let mut items = lock(&self.shared.items);
        let pos = items.iter().position(|item| item.sequence() == key)?;
        items.remove(pos)
    }
}

impl<T: Sequenced + Send + 'static> WaitQueue for FifoQueue<T> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn len(&self) -> usize {
        FifoQueue::len(self)
    }

    fn keys(&self) -> Vec<u32> {
        lock(&self.shared.items)
            .iter()
            .map(Sequenced::sequence)
            .collect()
    }

    fn contains_key(&self, key: u32) -> bool {
        lock(&self.shared.items)
            .iter()
            .any(|item| item.sequence() == key)
    }

    fn clear(&self) -> usize {
        let mut items = lock(&self.shared.items);
        let n = items.len();
        items.clear();
        n
    }

    fn attach(&self, hub: Weak<WaitHub>) {
        *lock(&self.shared.hub) = hub;
    }
}

// ── Priority by sequence ──

struct Ranked<T> {
    sequence: u32,
    arrival: u64,
    item: T,
}

// BinaryHeap is a max-heap: invert so the lowest sequence pops first and
// equal sequences keep arrival order.
impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .sequence
            .cmp(&self.sequence)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Ranked<T> {}

struct Heap<T> {
    heap: BinaryHeap<Ranked<T>>,
    arrivals: u64,
}

/// Queue that always yields the lowest request sequence first.
pub struct PriorityQueue<T> {
    shared: Arc<Shared<Heap<T>>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Sequenced> PriorityQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::new(
                name,
                Heap {
                    heap: BinaryHeap::new(),
                    arrivals: 0,
                },
            )),
        }
    }

    pub fn enque(&self, item: T) {
        {
            let mut items = lock(&self.shared.items);
            let arrival = items.arrivals;
            items.arrivals += 1;
            items.heap.push(Ranked {
                sequence: item.sequence(),
                arrival,
                item,
            });
        }
        self.shared.notify();
    }

    pub fn deque(&self) -> Option<T> {
        lock(&self.shared.items).heap.pop().map(|r| r.item)
    }

    /// Remove the item whose sequence equals `key`.
    pub fn deque_match(&self, key: u32) -> Option<T> {
        let mut items = lock(&self.shared.items);
        if !items.heap.iter().any(|r| r.sequence == key) {
            return None;
        }
        let mut ranked = std::mem::take(&mut items.heap).into_vec();
        let pos = ranked.iter().position(|r| r.sequence == key)?;
        let found = ranked.swap_remove(pos);
        items.heap = BinaryHeap::from(ranked);
        Some(found.item)
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.items).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Sequenced + Send + 'static> WaitQueue for PriorityQueue<T> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn len(&self) -> usize {
        PriorityQueue::len(self)
    }

    fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = lock(&self.shared.items)
            .heap
            .iter()
            .map(|r| r.sequence)
            .collect();
        keys.sort_unstable();
        keys
    }

    fn contains_key(&self, key: u32) -> bool {
        lock(&self.shared.items)
            .heap
            .iter()
            .any(|r| r.sequence == key)
    }

    fn clear(&self) -> usize {
        let mut items = lock(&self.shared.items);
        let n = items.heap.len();
        items.heap.clear();
        n
    }

    fn attach(&self, hub: Weak<WaitHub>) {
        *lock(&self.shared.hub) = hub;
    }
}

/// A node's input queue, FIFO or ordered by sequence.
pub enum InputQueue<T> {
    Fifo(FifoQueue<T>),
    Priority(PriorityQueue<T>),
}

impl<T> Clone for InputQueue<T> {
    fn clone(&self) -> Self {
        match self {
            InputQueue::Fifo(q) => InputQueue::Fifo(q.clone()),
            InputQueue::Priority(q) => InputQueue::Priority(q.clone()),
        }
    }
}

impl<T: Sequenced + Send + 'static> InputQueue<T> {
    pub fn new(name: impl Into<String>, by_sequence: bool) -> Self {
        if by_sequence {
            InputQueue::Priority(PriorityQueue::new(name))
        } else {
            InputQueue::Fifo(FifoQueue::new(name))
        }
    }

    pub fn enque(&self, item: T) {
        match self {
            InputQueue::Fifo(q) => q.enque(item),
            InputQueue::Priority(q) => q.enque(item),
        }
    }

    pub fn deque(&self) -> Option<T> {
        match self {
            InputQueue::Fifo(q) => q.deque(),
            InputQueue::Priority(q) => q.deque(),
        }
    }

    pub fn deque_match(&self, key: u32) -> Option<T> {
        match self {
            InputQueue::Fifo(q) => q.deque_match(key),
            InputQueue::Priority(q) => q.deque_match(key),
        }
    }

    pub fn as_wait_queue(&self) -> Arc<dyn WaitQueue> {
        match self {
            InputQueue::Fifo(q) => Arc::new(q.clone()),
            InputQueue::Priority(q) => Arc::new(q.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = FifoQueue::new("fifo");
        q.enque(3u32);
        q.enque(1u32);
        q.enque(2u32);
        assert_eq!(q.deque(), Some(3));
        assert_eq!(q.deque(), Some(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_priority_order_and_ties() {
        let q: PriorityQueue<(u32, char)> = PriorityQueue::new("prio");
        q.enque((5, 'a'));
        q.enque((1, 'b'));
        q.enque((5, 'c'));
        q.enque((0, 'd'));
        let order: Vec<_> = std::iter::from_fn(|| q.deque()).collect();
        assert_eq!(order, vec![(0, 'd'), (1, 'b'), (5, 'a'), (5, 'c')]);
    }

    #[test]
    fn test_deque_match() {
        let fifo = FifoQueue::new("fifo");
        let prio = PriorityQueue::new("prio");
        for seq in [4u32, 7, 9] {
            fifo.enque(seq);
            prio.enque(seq);
        }
        assert_eq!(fifo.deque_match(7), Some(7));
        assert_eq!(prio.deque_match(7), Some(7));
        assert_eq!(fifo.deque_match(7), None);
        assert_eq!(WaitQueue::keys(&fifo), vec![4, 9]);
        assert_eq!(WaitQueue::keys(&prio), vec![4, 9]);
    }

    #[test]
    fn test_clear_reports_count() {
        let q = InputQueue::new("q", true);
        q.enque(1u32);
        q.enque(2u32);
        let wait = q.as_wait_queue();
        assert_eq!(wait.len(), 2);
        assert_eq!(wait.clear(), 2);
        assert!(wait.is_empty());
        assert!(q.deque().is_none());
    }

    impl Sequenced for (u32, char) {
        fn sequence(&self) -> u32 {
            self.0
        }
    }
}

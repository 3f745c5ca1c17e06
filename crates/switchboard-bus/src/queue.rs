use std::cmp::Ordering;
use std::collections::BinaryHeap;
use switchboard_core::{Message, Priority, SwitchboardError, SwitchboardResult};

/// Heap entry ordered by priority, then by submission sequence.
#[derive(Debug)]
struct QueuedMessage {
    priority: Priority,
    sequence: u64,
    message: Message,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the earlier sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded priority queue of undelivered messages.
///
/// Pops the highest priority first and is FIFO within a priority tier.
#[derive(Debug)]
pub struct MessageQueue {
    heap: BinaryHeap<QueuedMessage>,
    next_sequence: u64,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
            capacity,
        }
    }

    /// Enqueue a message, failing if the queue is at capacity.
    pub fn push(&mut self, message: Message) -> SwitchboardResult<()> {
        if self.heap.len() >= self.capacity {
            return Err(SwitchboardError::QueueFull {
                capacity: self.capacity,
            });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedMessage {
            priority: message.priority,
            sequence,
            message,
        });
        Ok(())
    }

    /// Remove the highest-priority, earliest-submitted message.
    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|entry| entry.message)
    }

    pub fn peek_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|entry| entry.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Inbox - per-agent priority queue of deliveries

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::topic::MessagePriority;
use super::Subscription;

/// Envelope wrapped with its priority and arrival order
#[derive(Debug)]
struct Queued {
    envelope: Envelope,
    priority: MessagePriority,
    sequence: u64, // FIFO within the same priority
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller priority value first (Critical=0 before Normal=1)
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => {
                // Same priority, earlier arrival first
                other.sequence.cmp(&self.sequence)
            }
            ord => ord,
        }
    }
}

/// Priority inbox. Control messages pre-empt normal ones even when they arrived later.
///
/// At most `max_size` deliveries are ranked at once. Anything beyond that waits in
/// arrival order and is ranked as room frees up, so no delivery is lost while the
/// agent is running.
pub struct Inbox {
    heap: BinaryHeap<Queued>,
    overflow: VecDeque<Envelope>,
    sequence_counter: u64,
    max_size: usize,
    enqueued_count: u64,
    dequeued_count: u64,
    evicted_count: u64,
    deferred_count: u64,
}

impl Inbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            overflow: VecDeque::new(),
            sequence_counter: 0,
            max_size: max_size.max(1),
            enqueued_count: 0,
            dequeued_count: 0,
            evicted_count: 0,
            deferred_count: 0,
        }
    }

    /// Add a delivery.
    ///
    /// When full, a more urgent message evicts the newest least urgent entry back to
    /// the head of the overflow; anything else joins the tail of the overflow.
    pub fn push(&mut self, envelope: Envelope) {
        let priority = envelope.topic.priority();

        if self.heap.len() >= self.max_size {
            let lowest = self.heap.iter().min().map(|q| (q.priority, q.sequence));
            match lowest {
                Some((lowest_priority, lowest_sequence)) if priority < lowest_priority => {
                    let items = std::mem::take(&mut self.heap).into_vec();
                    let (evicted, kept): (Vec<Queued>, Vec<Queued>) = items
                        .into_iter()
                        .partition(|q| q.sequence == lowest_sequence);
                    self.heap = kept.into_iter().collect();
                    for queued in evicted {
                        self.overflow.push_front(queued.envelope);
                    }
                    self.evicted_count += 1;
                    warn!(
                        "Inbox full, deferred a {:?} message to make room for {:?}",
                        lowest_priority, priority
                    );
                }
                _ => {
                    self.deferred_count += 1;
                    debug!(
                        topic = %envelope.topic,
                        sequence_id = envelope.sequence_id,
                        waiting = self.overflow.len() + 1,
                        "Inbox full, delivery deferred"
                    );
                    self.overflow.push_back(envelope);
                    return;
                }
            }
        }

        self.rank(envelope);
    }

    fn rank(&mut self, envelope: Envelope) {
        let priority = envelope.topic.priority();
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;

        debug!(
            topic = %envelope.topic,
            producer_id = %envelope.producer_id,
            sequence_id = envelope.sequence_id,
            "queued {:?} delivery", priority
        );

        self.heap.push(Queued {
            envelope,
            priority,
            sequence,
        });
        self.enqueued_count += 1;
    }

    /// Move every delivery that is already waiting on the subscription into the inbox.
    /// Returns how many were taken.
    pub fn fill_from(&mut self, subscription: &mut Subscription) -> usize {
        let mut taken = 0;
        while let Some(envelope) = subscription.try_recv() {
            self.push(envelope);
            taken += 1;
        }
        taken
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        let queued = self.heap.pop()?;
        self.dequeued_count += 1;
        while self.heap.len() < self.max_size {
            let Some(waiting) = self.overflow.pop_front() else {
                break;
            };
            self.rank(waiting);
        }
        Some(queued.envelope)
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.heap.peek().map(|q| &q.envelope)
    }

    /// Is a control message waiting?
    pub fn has_control(&self) -> bool {
        self.heap
            .peek()
            .map_or(false, |q| q.priority == MessagePriority::Critical)
    }

    pub fn len(&self) -> usize {
        self.heap.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.overflow.is_empty()
    }

    pub fn stats(&self) -> InboxStats {
        let critical = self
            .heap
            .iter()
            .filter(|q| q.priority == MessagePriority::Critical)
            .count();
        InboxStats {
            current_size: self.heap.len(),
            max_size: self.max_size,
            waiting: self.overflow.len(),
            enqueued_total: self.enqueued_count,
            dequeued_total: self.dequeued_count,
            evicted_total: self.evicted_count,
            deferred_total: self.deferred_count,
            critical_count: critical,
            normal_count: self.heap.len() - critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxStats {
    pub current_size: usize,
    pub max_size: usize,
    /// Deliveries held beyond `max_size`
    pub waiting: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    /// Ranked deliveries pushed back out by a more urgent one
    pub evicted_total: u64,
    /// Deliveries that arrived while the inbox was full
    pub deferred_total: u64,
    pub critical_count: usize,
    pub normal_count: usize,
}

impl std::fmt::Display for InboxStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Inbox[{}/{}+{}, enq={}, deq={}, evicted={}, deferred={}, C={}/N={}]",
            self.current_size,
            self.max_size,
            self.waiting,
            self.enqueued_total,
            self.dequeued_total,
            self.evicted_total,
            self.deferred_total,
            self.critical_count,
            self.normal_count
        )
    }
}

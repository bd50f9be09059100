//! Queue of local mutations waiting for the remote service.

use crate::mutation::{MutationEvent, OpType};
use crate::{Model, ModelName, Predicate};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// One pending mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMutation {
    pub model: ModelName,
    pub op_type: OpType,
    pub element: Model,
    pub condition: Option<Predicate>,
}

impl OutboxMutation {
    pub fn model_id(&self) -> &str {
        self.element.id()
    }

    fn targets(&self, model: &str, id: &str) -> bool {
        self.model == model && self.element.id() == id
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<OutboxMutation>,
    /// Head is being sent and must not be rewritten
    head_in_flight: bool,
}

/// FIFO of pending mutations with update merging.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<Queue>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a local mutation.
    ///
    /// An update to a record that is already queued (and not in flight)
    /// replaces the queued element, keeping the queued operation kind. A
    /// delete drops queued work for the record; if that work included the
    /// record's insert, nothing is left to send.
    pub fn enqueue(&self, event: &MutationEvent) {
        let mut queue = self.queue.lock();
        let skip = usize::from(queue.head_in_flight);
        let id = event.element.id();

        match event.op_type {
            OpType::Insert => queue.items.push_back(Self::mutation(event)),
            OpType::Update => {
                let queued = queue
                    .items
                    .iter_mut()
                    .skip(skip)
                    .find(|m| m.targets(&event.model, id) && m.op_type != OpType::Delete);
                match queued {
                    Some(queued) => {
                        queued.element = event.element.clone();
                        queued.condition = event.condition.clone();
                    }
                    None => queue.items.push_back(Self::mutation(event)),
                }
            }
            OpType::Delete => {
                let mut index = 0;
                let mut dropped_insert = false;
                queue.items.retain(|m| {
                    let keep = index < skip || !m.targets(&event.model, id);
                    if !keep && m.op_type == OpType::Insert {
                        dropped_insert = true;
                    }
                    index += 1;
                    keep
                });
                if !dropped_insert {
                    queue.items.push_back(Self::mutation(event));
                }
            }
        }

        tracing::debug!(
            model = %event.model,
            id = %id,
            op = ?event.op_type,
            pending = queue.items.len(),
            "outbox updated"
        );
    }

    fn mutation(event: &MutationEvent) -> OutboxMutation {
        OutboxMutation {
            model: event.model.clone(),
            op_type: event.op_type,
            element: event.element.clone(),
            condition: event.condition.clone(),
        }
    }

    /// Take the head for sending. It stays queued until [`Outbox::dequeue`].
    pub fn peek(&self) -> Option<OutboxMutation> {
        let mut queue = self.queue.lock();
        let head = queue.items.front().cloned();
        queue.head_in_flight = head.is_some();
        head
    }

    /// Remove the head once sent.
    pub fn dequeue(&self) -> Option<OutboxMutation> {
        let mut queue = self.queue.lock();
        queue.head_in_flight = false;
        queue.items.pop_front()
    }

    /// Whether a mutation for this record is waiting.
    pub fn has_pending(&self, model: &str, id: &str) -> bool {
        self.queue.lock().items.iter().any(|m| m.targets(model, id))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.items.clear();
        queue.head_in_flight = false;
    }
}

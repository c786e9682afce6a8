//! Event and messaging system.
//!
//! A small typed event bus. The reconciliation core publishes entity and
//! world events here; collaborators (renderer, builder UI, chat UI) drain
//! the types they care about instead of being wired in through constructor
//! callbacks.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::net::{EntityRecord, PlacedObject, SessionId};

/// Entity lifecycle events emitted by the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// A live entity was created. Emitted exactly once per creation.
    Added(EntityRecord),
    /// A live entity's fields changed.
    Updated(EntityRecord),
    /// A live entity was removed (notification, list absence, or eviction).
    Removed(SessionId),
}

/// Durable-world events.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    /// A placed object was applied to the local log.
    ObjectPlaced(PlacedObject),
}

/// A relayed chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub sender: SessionId,
    pub name: String,
    pub text: String,
}

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send + Sync>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        let q = q.downcast_mut::<Vec<E>>().expect("queue type mismatch");
        q.push(e);
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }

    /// Number of queued events of a type.
    pub fn pending<E: 'static + Send + Sync>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<Vec<E>>())
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_by_type() {
        let mut bus = EventBus::default();
        bus.push(EntityEvent::Removed(SessionId(1)));
        bus.push(ChatEvent {
            sender: SessionId(2),
            name: "Ada".into(),
            text: "hi".into(),
        });

        assert_eq!(bus.pending::<EntityEvent>(), 1);
        let entity_events = bus.drain::<EntityEvent>();
        assert_eq!(entity_events, vec![EntityEvent::Removed(SessionId(1))]);
        // Chat queue untouched by the entity drain.
        assert_eq!(bus.pending::<ChatEvent>(), 1);
        assert!(bus.drain::<EntityEvent>().is_empty());
    }
}

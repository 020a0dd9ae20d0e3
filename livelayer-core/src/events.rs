//! Collection mutation events.
//!
//! A collection emits one [`MutationEvent`] per changed document after the change has been
//! persisted. Listeners run synchronously inside the mutating call, in subscription order,
//! so an observer always sees events in the order the mutations happened.
//!
//! Before touching anything locally, a mutation also announces itself as a [`SyncEvent`] on
//! a separate bus. That bus is meant for replicating writes elsewhere; observed cursors never
//! listen to it. Mutations made with `quiet` set skip the announcement.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use bson::Document;

use crate::matcher::Selector;

/// Callback invoked for every emitted event.
pub type EventListener<E = MutationEvent> = Arc<dyn Fn(&E) + Send + Sync>;

/// An event an [`EventBus`] can carry.
pub trait BusEvent: Send + Sync + 'static {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;
}


/// A committed change to a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    Insert { doc: Document },
    Update { new: Document, old: Document },
    Remove { old: Document },
}

impl MutationEvent {
    /// The document after the change, if it still exists.
    pub fn new_doc(&self) -> Option<&Document> {
        match self {
            MutationEvent::Insert { doc } => Some(doc),
            MutationEvent::Update { new, .. } => Some(new),
            MutationEvent::Remove { .. } => None,
        }
    }

    /// The document before the change, if it existed.
    pub fn old_doc(&self) -> Option<&Document> {
        match self {
            MutationEvent::Insert { .. } => None,
            MutationEvent::Update { old, .. } => Some(old),
            MutationEvent::Remove { old } => Some(old),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationEvent::Insert { .. } => "insert",
            MutationEvent::Update { .. } => "update",
            MutationEvent::Remove { .. } => "remove",
        }
    }
}

impl BusEvent for MutationEvent {
    fn kind(&self) -> &'static str {
        MutationEvent::kind(self)
    }
}

/// A mutation about to be applied, announced with the arguments it was requested with.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The document as it will be stored, `_id` included.
    Insert { doc: Document },
    Update { selector: Selector, modifier: Document },
    Remove { selector: Selector, multi: bool },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Insert { .. } => "sync:insert",
            SyncEvent::Update { .. } => "sync:update",
            SyncEvent::Remove { .. } => "sync:remove",
        }
    }
}

impl BusEvent for SyncEvent {
    fn kind(&self) -> &'static str {
        SyncEvent::kind(self)
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Listeners<E> {
    entries: Vec<(SubscriptionId, EventListener<E>)>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

/// A synchronous, in-process event bus. Clones share the same subscriptions.
pub struct EventBus<E = MutationEvent> {
    listeners: Arc<Mutex<Listeners<E>>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .push((id, Arc::new(listener)));

        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();

        listeners.entries.retain(|(existing, _)| *existing != id);
        listeners.entries.len() != before
    }

    /// Delivers `event` to every current listener.
    ///
    /// The registry lock is released before listeners run, so listeners may subscribe or
    /// unsubscribe while handling an event. A listener removed during delivery may still
    /// receive the event being delivered.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<EventListener<E>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        tracing::trace!(kind = event.kind(), listeners = listeners.len(), "emitting event");

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_delivery_order_and_unsubscribe() {
        let bus: EventBus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            bus.subscribe(move |event| seen.lock().unwrap().push(format!("first:{}", event.kind())))
        };
        {
            let seen = seen.clone();
            bus.subscribe(move |event| seen.lock().unwrap().push(format!("second:{}", event.kind())));
        }

        bus.emit(&MutationEvent::Insert { doc: doc! { "_id": 1 } });
        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.emit(&MutationEvent::Remove { old: doc! { "_id": 1 } });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:insert", "second:insert", "second:remove"]
        );
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let bus: EventBus = EventBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let id = {
            let bus = bus.clone();
            let slot = slot.clone();
            bus.clone().subscribe(move |_| {
                if let Some(id) = *slot.lock().unwrap() {
                    bus.unsubscribe(id);
                }
            })
        };
        *slot.lock().unwrap() = Some(id);

        bus.emit(&MutationEvent::Insert { doc: doc! {} });
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_event_accessors() {
        let event = MutationEvent::Update { new: doc! { "v": 2 }, old: doc! { "v": 1 } };

        assert_eq!(event.new_doc(), Some(&doc! { "v": 2 }));
        assert_eq!(event.old_doc(), Some(&doc! { "v": 1 }));
        assert_eq!(MutationEvent::Remove { old: doc! {} }.new_doc(), None);
    }

    #[test]
    fn test_sync_events_use_their_own_bus() {
        let sync: EventBus<SyncEvent> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            sync.subscribe(move |event| seen.lock().unwrap().push(event.kind()));
        }

        sync.emit(&SyncEvent::Insert { doc: doc! { "_id": 1 } });
        sync.emit(&SyncEvent::Remove { selector: Selector::from(doc! {}), multi: true });

        assert_eq!(*seen.lock().unwrap(), vec!["sync:insert", "sync:remove"]);
    }
}

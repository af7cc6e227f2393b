//! # Notification bus
//!
//! Fans batches of changed entities out to every subscribed query cache, in subscription
//! order. Delivery is synchronous; a failing or panicking handler is logged and does not stop
//! delivery to the handlers after it. The bus holds handlers weakly, so a dropped cache simply stops
//! receiving changes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{trace, warn};

use crate::data::Data;
use crate::entity_store::{ChangedEntity, EntityLookup};
use crate::error::Error;

/// A batch of changes together with read access to the committed store.
pub struct ChangeSet<'a> {
    changes: &'a [ChangedEntity],
    store: &'a dyn EntityLookup,
}

impl<'a> ChangeSet<'a> {
    pub fn new(changes: &'a [ChangedEntity], store: &'a dyn EntityLookup) -> Self {
        ChangeSet { changes, store }
    }

    pub fn changes(&self) -> &'a [ChangedEntity] {
        self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'a, ChangedEntity> {
        self.changes.iter()
    }

    /// Current entity for an id; `None` if unknown or deleted in this batch.
    pub fn lookup(&self, id: &str) -> Option<Data> {
        match self.changes.iter().rev().find(|c| c.id == id) {
            Some(change) if change.is_deletion() => None,
            Some(change) => Some(change.entity.clone()),
            None => self.store.lookup(id),
        }
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.changes
            .iter()
            .rev()
            .find(|c| c.id == id)
            .is_some_and(ChangedEntity::is_deletion)
    }
}

pub trait CacheSubscriber: Send + Sync {
    /// Applies a change batch; returns true if the cache changed.
    fn update_cache(&self, changes: &ChangeSet<'_>) -> Result<bool, Error>;
}

#[derive(Default)]
pub struct NotificationBus {
    handlers: Mutex<Vec<(u64, Weak<dyn CacheSubscriber>)>>,
    next_id: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, handler: Weak<dyn CacheSubscriber>) -> BusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, handler));
        BusSubscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(handler_id, _)| *handler_id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Weak<dyn CacheSubscriber>)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers a change batch to every live handler; returns how many caches changed.
    /// Empty batches are not published.
    pub fn notify(&self, changes: &ChangeSet<'_>) -> usize {
        if changes.is_empty() {
            return 0;
        }
        // handlers may subscribe or unsubscribe while being notified
        let handlers: Vec<Arc<dyn CacheSubscriber>> = {
            let mut guard = self.lock();
            guard.retain(|(_, handler)| handler.strong_count() > 0);
            guard.iter().filter_map(|(_, h)| h.upgrade()).collect()
        };
        let mut updated = 0;
        for handler in handlers {
            // user callbacks (entity filters, mappers) run inside the handler
            match catch_unwind(AssertUnwindSafe(|| handler.update_cache(changes))) {
                Ok(Ok(true)) => updated += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "Cache subscriber failed to apply changes"),
                Err(panic) => warn!(
                    panic = panic_message(panic.as_ref()),
                    "Cache subscriber panicked while applying changes"
                ),
            }
        }
        trace!(changes = changes.changes().len(), updated, "Changes published");
        updated
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Handle of a bus subscription; dropping it unsubscribes.
pub struct BusSubscription {
    id: u64,
    bus: Weak<NotificationBus>,
}

impl BusSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeSpec};
    use crate::entity_store::{ChangeKind, EntityStore};
    use crate::pipeline::{normalize, NormalizedRecord};

    #[derive(Clone, Copy)]
    enum Outcome {
        Updated,
        Fails,
        Panics,
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: Outcome,
    }

    impl CacheSubscriber for Recorder {
        fn update_cache(&self, _changes: &ChangeSet<'_>) -> Result<bool, Error> {
            self.log.lock().unwrap().push(self.name);
            match self.outcome {
                Outcome::Updated => Ok(true),
                Outcome::Fails => Err(Error::general_error("boom".to_owned())),
                Outcome::Panics => panic!("handler {} exploded", self.name),
            }
        }
    }

    fn change() -> ChangedEntity {
        let doc = Arc::new(Document::query(
            "User",
            NodeSpec::root().object("user", NodeSpec::entity("User")),
        ));
        let record: NormalizedRecord = normalize(
            &doc,
            &Data::from(serde_json::json!({"user": {"id": "u1", "__typename": "User"}})),
        )
        .unwrap()
        .remove(0);
        ChangedEntity {
            id: "u1".to_owned(),
            typename: "User".to_owned(),
            kind: ChangeKind::Created,
            entity: record.to_entity(),
            updates: record.fields.clone(),
            record: Arc::new(record),
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        outcome: Outcome,
    ) -> Arc<dyn CacheSubscriber> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            outcome,
        })
    }

    #[test]
    fn test_delivery_order_and_isolation() {
        let bus = NotificationBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder("a", &log, Outcome::Updated);
        let b = recorder("b", &log, Outcome::Fails);
        let c = recorder("c", &log, Outcome::Updated);
        let _sa = bus.subscribe(Arc::downgrade(&a));
        let _sb = bus.subscribe(Arc::downgrade(&b));
        let _sc = bus.subscribe(Arc::downgrade(&c));
        let store = EntityStore::new();
        let changes = vec![change()];
        let updated = bus.notify(&ChangeSet::new(&changes, &store));
        assert_eq!(updated, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let bus = NotificationBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder("a", &log, Outcome::Panics);
        let b = recorder("b", &log, Outcome::Updated);
        let _sa = bus.subscribe(Arc::downgrade(&a));
        let _sb = bus.subscribe(Arc::downgrade(&b));
        let store = EntityStore::new();
        let changes = vec![change()];
        assert_eq!(bus.notify(&ChangeSet::new(&changes, &store)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        // the panicking handler stays subscribed and is called again
        assert_eq!(bus.notify(&ChangeSet::new(&changes, &store)), 1);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_empty_batch_is_not_published() {
        let bus = NotificationBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder("a", &log, Outcome::Updated);
        let _sa = bus.subscribe(Arc::downgrade(&a));
        let store = EntityStore::new();
        assert_eq!(bus.notify(&ChangeSet::new(&[], &store)), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_and_dropped_handlers() {
        let bus = NotificationBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder("a", &log, Outcome::Updated);
        let b = recorder("b", &log, Outcome::Updated);
        let sa = bus.subscribe(Arc::downgrade(&a));
        let _sb = bus.subscribe(Arc::downgrade(&b));
        assert_eq!(bus.len(), 2);
        sa.unsubscribe();
        assert_eq!(bus.len(), 1);
        drop(b);
        let store = EntityStore::new();
        let changes = vec![change()];
        assert_eq!(bus.notify(&ChangeSet::new(&changes, &store)), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_lookup_prefers_batch() {
        let store = EntityStore::new();
        let changes = vec![change()];
        let set = ChangeSet::new(&changes, &store);
        assert!(set.lookup("u1").is_some());
        assert!(set.lookup("u2").is_none());
        assert!(!set.is_deleted("u1"));
    }
}

// Candle event fan-out.
//
// Listeners are dispatched from a snapshot taken under a short read lock, so a
// listener may subscribe or unsubscribe (itself or others) while an event is
// being delivered. Removal takes effect from the next event onwards.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::market_data::AggregatedCandle;

pub type CandleListener = Arc<dyn Fn(&AggregatedCandle) + Send + Sync>;

type ListenerList = RwLock<Vec<(Uuid, CandleListener)>>;

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<ListenerList>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AggregatedCandle) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn dispatch(&self, candle: &AggregatedCandle) {
        let snapshot: Vec<CandleListener> =
            self.inner.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener(candle);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    registry: Weak<ListenerList>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(self) {}

    /// Keep the listener registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.registry.upgrade() {
            list.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{BaseCandle, CandleKey};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> AggregatedCandle {
        AggregatedCandle::forming(
            &CandleKey::new("BTCUSDT", "1m"),
            BaseCandle::new(0, 1.0, 1.0, 1.0, 1.0, 0.0),
        )
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch(&event());
        sub.unsubscribe();
        registry.dispatch(&event());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn detached_listener_stays_registered() {
        let registry = ListenerRegistry::new();
        registry.subscribe(|_| {}).detach();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsubscribe_from_inside_dispatch() {
        let registry = ListenerRegistry::new();
        let b_hits = Arc::new(AtomicUsize::new(0));

        let b_counter = Arc::clone(&b_hits);
        let sub_b = registry.subscribe(move |_| {
            b_counter.fetch_add(1, Ordering::SeqCst);
        });

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(Some(sub_b)));
        let slot_a = Arc::clone(&slot);
        registry
            .subscribe(move |_| {
                if let Some(sub) = slot_a.lock().take() {
                    sub.unsubscribe();
                }
            })
            .detach();

        // B was in the snapshot for the first event; it sees that one only.
        registry.dispatch(&event());
        registry.dispatch(&event());

        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let registry = ListenerRegistry::new();
        let sub = registry.subscribe(|_| {});
        drop(registry);
        drop(sub);
    }
}

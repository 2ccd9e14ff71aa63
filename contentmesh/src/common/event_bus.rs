use crate::common::MUTATION_EVENT;
use crate::errors::{ErrorKind, MeshError, MeshResult};
use basu::error::BasuError;
use basu::event::Event;
use basu::{EventBus, Handle, HandlerId};
use std::marker::PhantomData;
use std::sync::Arc;

/// Publishes events to registered listeners.
///
/// The mesh uses one bus for [MutationEvent](crate::event::MutationEvent)s:
/// the migration engine and the authoring layer publish, the sync queue
/// listens. Publishing without listeners is a cheap no-op.
///
/// # Example
///
/// ```ignore
/// let bus: MeshEventBus<MutationEvent, MutationListener> = MeshEventBus::new();
/// let subscriber = bus.register(MutationListener::new(|event| Ok(())))?;
/// bus.publish(event)?;
/// bus.deregister(subscriber)?;
/// ```
#[derive(Clone)]
pub struct MeshEventBus<E, L> {
    inner: Arc<MeshEventBusInner<E, L>>,
}

impl<E, L> Default for MeshEventBus<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, L> MeshEventBus<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    pub fn new() -> Self {
        MeshEventBus {
            inner: Arc::new(MeshEventBusInner::new()),
        }
    }

    /// Registers an event listener with the bus.
    pub fn register(&self, listener: L) -> MeshResult<SubscriberRef> {
        self.inner.register(listener)
    }

    /// Deregisters a previously registered event listener.
    pub fn deregister(&self, subscriber: SubscriberRef) -> MeshResult<()> {
        self.inner.deregister(subscriber)
    }

    /// Publishes an event to all registered listeners.
    pub fn publish(&self, event: E) -> MeshResult<()> {
        self.inner.publish(event)
    }

    /// Removes every registered listener.
    pub fn close(&self) -> MeshResult<()> {
        self.inner.close()
    }

    pub fn has_listeners(&self) -> bool {
        self.inner.has_listeners()
    }
}

/// Token returned by [MeshEventBus::register], used to deregister.
pub struct SubscriberRef {
    pub(crate) inner: HandlerId,
}

impl SubscriberRef {
    pub fn new(inner: HandlerId) -> Self {
        SubscriberRef { inner }
    }
}

struct MeshEventBusInner<E, L> {
    event_bus: EventBus<E>,
    phantom_data: PhantomData<L>,
}

impl<E, L> MeshEventBusInner<E, L>
where
    L: Handle<E> + 'static,
    E: Send + Sync,
{
    fn new() -> Self {
        MeshEventBusInner {
            event_bus: EventBus::new(),
            phantom_data: PhantomData,
        }
    }

    fn register(&self, listener: L) -> MeshResult<SubscriberRef> {
        self.event_bus
            .subscribe(MUTATION_EVENT, Box::new(listener))
            .map(SubscriberRef::new)
            .map_err(Self::mesh_error)
    }

    fn deregister(&self, subscriber: SubscriberRef) -> MeshResult<()> {
        self.event_bus
            .unsubscribe(MUTATION_EVENT, &subscriber.inner)
            .map(|_| ())
            .map_err(Self::mesh_error)
    }

    fn publish(&self, event: E) -> MeshResult<()> {
        let handler_count = match self.event_bus.get_handler_count(MUTATION_EVENT) {
            Ok(count) => count,
            Err(BasuError::EventTypeNotFOUND) => return Ok(()),
            Err(e) => return Err(Self::mesh_error(e)),
        };

        if handler_count == 0 {
            return Ok(());
        }

        self.event_bus
            .publish(MUTATION_EVENT, &Event::new(event))
            .map(|_| ())
            .map_err(Self::mesh_error)
    }

    fn close(&self) -> MeshResult<()> {
        self.event_bus.clear().map(|_| ()).map_err(Self::mesh_error)
    }

    fn has_listeners(&self) -> bool {
        match self.event_bus.get_handler_count(MUTATION_EVENT) {
            Ok(count) => count > 0,
            Err(BasuError::EventTypeNotFOUND) => false,
            Err(e) => {
                log::warn!("Failed to check listeners: {}, defaulting to false", e);
                false
            }
        }
    }

    fn mesh_error(e: BasuError) -> MeshError {
        match e {
            BasuError::EventTypeNotFOUND => MeshError::new(
                "Event bus error: no handler is registered for mutation events",
                ErrorKind::EventError,
            ),
            BasuError::MutexPoisoned => MeshError::new(
                "Event bus error: internal mutex poisoned",
                ErrorKind::EventError,
            ),
            BasuError::HandlerError(e) => {
                let message = e
                    .source()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| e.to_string());
                MeshError::new(&format!("Event handler error: {}", message), ErrorKind::EventError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl Handle<u32> for CountingListener {
        fn handle(&self, _event: &Event<u32>) -> Result<(), BasuError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn listener() -> (CountingListener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (CountingListener { count: count.clone() }, count)
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let bus: MeshEventBus<u32, CountingListener> = MeshEventBus::new();
        assert!(bus.publish(1).is_ok());
        assert!(!bus.has_listeners());
    }

    #[test]
    fn test_publish_reaches_listener() {
        let bus: MeshEventBus<u32, CountingListener> = MeshEventBus::new();
        let (l, count) = listener();
        bus.register(l).unwrap();
        bus.publish(7).unwrap();
        bus.publish(8).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(bus.has_listeners());
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let bus: MeshEventBus<u32, CountingListener> = MeshEventBus::new();
        let (l, count) = listener();
        let subscriber = bus.register(l).unwrap();
        bus.deregister(subscriber).unwrap();
        bus.publish(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deregister_unknown_subscriber_fails() {
        let bus: MeshEventBus<u32, CountingListener> = MeshEventBus::new();
        let result = bus.deregister(SubscriberRef::new(HandlerId::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_close_clears_listeners() {
        let bus: MeshEventBus<u32, CountingListener> = MeshEventBus::new();
        let (l, _) = listener();
        bus.register(l).unwrap();
        bus.close().unwrap();
        assert!(!bus.has_listeners());
    }

    #[test]
    fn test_handler_error_maps_to_event_error() {
        let error = BasuError::HandlerError(anyhow::anyhow!("listener failed"));
        let mapped = MeshEventBusInner::<u32, CountingListener>::mesh_error(error);
        assert_eq!(mapped.kind(), &ErrorKind::EventError);
        assert!(mapped.message().contains("listener failed"));
    }
}

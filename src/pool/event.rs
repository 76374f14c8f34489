//! Event containers and the handles that refer to them.
//!
//! Events live in the [`EventPool`](super::EventPool) arena for the lifetime
//! of the pool. Queues and arrows never own an [`Event`]; they carry an
//! [`EventHandle`], which is move-only so that an event checked out of the
//! pool is held by exactly one party and returned exactly once.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index into the pool's event arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

impl EventId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Exclusive claim on one pooled event.
///
/// Not `Clone`: give it back with [`EventPool::put`](super::EventPool::put).
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an event handle must be returned to the pool"]
pub struct EventHandle {
    id: EventId,
}

impl EventHandle {
    pub(crate) fn new(id: EventId) -> Self {
        Self { id }
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }
}

/// Diagnostic counters, cleared whenever the event is recycled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDiagnostics {
    /// Number of stage `execute` calls made on this event
    pub stages_executed: u32,
    /// Number of products inserted
    pub products_inserted: u32,
}

/// A reusable processing-unit container.
pub struct Event {
    id: EventId,
    run_number: i32,
    event_number: u64,
    source: Option<Arc<str>>,
    application: Option<Arc<str>>,
    products: HashMap<String, Box<dyn Any + Send>>,
    diagnostics: EventDiagnostics,
}

impl Event {
    pub(crate) fn new(id: EventId) -> Self {
        Self {
            id,
            run_number: 0,
            event_number: 0,
            source: None,
            application: None,
            products: HashMap::new(),
            diagnostics: EventDiagnostics::default(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn run_number(&self) -> i32 {
        self.run_number
    }

    pub fn set_run_number(&mut self, run_number: i32) {
        self.run_number = run_number;
    }

    pub fn event_number(&self) -> u64 {
        self.event_number
    }

    pub fn set_event_number(&mut self, event_number: u64) {
        self.event_number = event_number;
    }

    /// Name of the source that produced this event
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Identity of the application that owns this event
    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub(crate) fn tag(&mut self, source: &Arc<str>, application: &Arc<str>) {
        self.source = Some(Arc::clone(source));
        self.application = Some(Arc::clone(application));
    }

    /// Store a product under `name`, replacing any previous value
    pub fn insert<T: Any + Send>(&mut self, name: impl Into<String>, value: T) {
        self.products.insert(name.into(), Box::new(value));
        self.diagnostics.products_inserted += 1;
    }

    /// Borrow a product, if present with the requested type
    pub fn get<T: Any + Send>(&self, name: &str) -> Option<&T> {
        self.products.get(name).and_then(|p| p.downcast_ref::<T>())
    }

    /// Mutably borrow a product, if present with the requested type
    pub fn get_mut<T: Any + Send>(&mut self, name: &str) -> Option<&mut T> {
        self.products.get_mut(name).and_then(|p| p.downcast_mut::<T>())
    }

    /// Remove a product. A product of a different type is left in place.
    pub fn take<T: Any + Send>(&mut self, name: &str) -> Option<T> {
        if !self.products.get(name).is_some_and(|p| p.is::<T>()) {
            return None;
        }
        self.products
            .remove(name)
            .and_then(|p| p.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.products.contains_key(name)
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn diagnostics(&self) -> &EventDiagnostics {
        &self.diagnostics
    }

    pub(crate) fn record_stage_execution(&mut self) {
        self.diagnostics.stages_executed += 1;
    }

    /// Release every product and clear identity and diagnostics.
    pub fn reset(&mut self) {
        self.run_number = 0;
        self.event_number = 0;
        self.source = None;
        self.application = None;
        self.products.clear();
        self.diagnostics = EventDiagnostics::default();
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("run_number", &self.run_number)
            .field("event_number", &self.event_number)
            .field("source", &self.source)
            .field("products", &self.products.keys().collect::<Vec<_>>())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_products() {
        let mut event = Event::new(EventId(0));
        event.insert("hits", vec![1.0f64, 2.0]);
        event.insert("count", 2u32);

        assert_eq!(event.get::<Vec<f64>>("hits"), Some(&vec![1.0, 2.0]));
        assert_eq!(event.get::<u32>("count"), Some(&2));
        // Wrong type is not visible
        assert!(event.get::<u64>("count").is_none());
        assert!(event.take::<u64>("count").is_none());
        assert!(event.contains("count"));

        assert_eq!(event.take::<u32>("count"), Some(2));
        assert!(!event.contains("count"));
        assert_eq!(event.diagnostics().products_inserted, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut event = Event::new(EventId(3));
        let source: Arc<str> = Arc::from("file");
        let app: Arc<str> = Arc::from("app");
        event.tag(&source, &app);
        event.set_run_number(7);
        event.set_event_number(42);
        event.insert("hits", 1u8);
        event.record_stage_execution();

        event.reset();

        assert_eq!(event.id(), EventId(3));
        assert_eq!(event.run_number(), 0);
        assert_eq!(event.event_number(), 0);
        assert!(event.source().is_none());
        assert!(event.application().is_none());
        assert_eq!(event.product_count(), 0);
        assert_eq!(event.diagnostics(), &EventDiagnostics::default());
    }
}

//! Sharded pool of reusable events.
//!
//! The pool is the only allocator of [`Event`]s. All events live in a single
//! arena indexed by [`EventId`]; free events are tracked per *location* (a
//! small stack of ids behind its own lock) so that workers pinned to
//! different locations rarely contend.
//!
//! # Bounds
//!
//! - `location_count × pool_size` events are created up front.
//! - No location ever holds more than `pool_size` free events.
//! - A checkout first tries its home location, then the others. When every
//!   location is empty the pool either reports "unavailable" (bounded mode,
//!   `limit_total_events_in_flight`) or hands out a spare/new event.
//! - Returned events are reset and parked at the first location with room;
//!   only extras created in unbounded mode can overflow into the spare list.
//!
//! # Lock order
//!
//! `with_event*` takes the arena read lock only long enough to clone the
//! event's `Arc`, then runs the closure under the event's own mutex. Growing
//! the arena therefore never waits on user code. Do not touch the same event
//! again from inside the closure.

pub mod event;

pub use event::{Event, EventDiagnostics, EventHandle, EventId};

use crate::config::PoolSettings;
use crate::error::{EngineError, EngineResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// One location's free list, padded to its own cache line.
#[repr(align(64))]
struct LocalPool {
    free: Mutex<Vec<EventId>>,
}

/// Sharded, capacity-bounded cache of reusable events.
pub struct EventPool {
    arena: RwLock<Vec<Arc<Mutex<Event>>>>,
    locations: Box<[LocalPool]>,
    /// Free events that did not fit in any location (unbounded mode only)
    spare: Mutex<Vec<EventId>>,
    pool_size: usize,
    limit_total_events_in_flight: bool,
    in_flight: AtomicUsize,
}

impl EventPool {
    /// Create the pool and eagerly allocate every pooled event
    pub fn new(settings: &PoolSettings) -> EngineResult<Self> {
        if settings.location_count == 0 {
            return Err(EngineError::Config(
                "event pool needs at least one location".to_string(),
            ));
        }

        let total = settings.location_count * settings.pool_size;
        let arena: Vec<Arc<Mutex<Event>>> = (0..total)
            .map(|i| Arc::new(Mutex::new(Event::new(EventId(i as u32)))))
            .collect();

        let locations: Box<[LocalPool]> = (0..settings.location_count)
            .map(|loc| {
                let first = loc * settings.pool_size;
                let ids = (first..first + settings.pool_size)
                    .map(|i| EventId(i as u32))
                    .collect();
                LocalPool {
                    free: Mutex::new(ids),
                }
            })
            .collect();

        tracing::debug!(
            "Event pool created: {} locations x {} events (limited: {})",
            settings.location_count,
            settings.pool_size,
            settings.limit_total_events_in_flight
        );

        Ok(Self {
            arena: RwLock::new(arena),
            locations,
            spare: Mutex::new(Vec::new()),
            pool_size: settings.pool_size,
            limit_total_events_in_flight: settings.limit_total_events_in_flight,
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Check out an event near `location`.
    ///
    /// Returns `None` only in bounded mode when no free event exists anywhere.
    pub fn get(&self, location: usize) -> Option<EventHandle> {
        let count = self.locations.len();
        let home = location % count;

        for offset in 0..count {
            let pool = &self.locations[(home + offset) % count];
            let mut free = pool.free.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = free.pop() {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return Some(EventHandle::new(id));
            }
        }

        if self.limit_total_events_in_flight {
            return None;
        }

        let spare = self
            .spare
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let id = match spare {
            Some(id) => id,
            None => {
                let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
                let id = EventId(arena.len() as u32);
                arena.push(Arc::new(Mutex::new(Event::new(id))));
                tracing::trace!("Event pool exhausted, allocated {}", id);
                id
            }
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(EventHandle::new(id))
    }

    /// Reset an event and return it to the pool.
    pub fn put(&self, handle: EventHandle, location: usize) {
        let id = handle.id();
        self.with_event_mut(&handle, Event::reset);

        let count = self.locations.len();
        let home = location % count;
        let mut parked = false;
        for offset in 0..count {
            let pool = &self.locations[(home + offset) % count];
            let mut free = pool.free.lock().unwrap_or_else(PoisonError::into_inner);
            if free.len() < self.pool_size {
                free.push(id);
                parked = true;
                break;
            }
        }
        if !parked {
            self.spare
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Run `f` with shared access to the event behind `handle`
    pub fn with_event<R>(&self, handle: &EventHandle, f: impl FnOnce(&Event) -> R) -> R {
        let slot = self.slot(handle);
        let event = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&event)
    }

    /// Run `f` with exclusive access to the event behind `handle`
    pub fn with_event_mut<R>(&self, handle: &EventHandle, f: impl FnOnce(&mut Event) -> R) -> R {
        let slot = self.slot(handle);
        let mut event = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut event)
    }

    fn slot(&self, handle: &EventHandle) -> Arc<Mutex<Event>> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&arena[handle.id().index()])
    }

    /// Maximum number of free events held per location
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn limits_events_in_flight(&self) -> bool {
        self.limit_total_events_in_flight
    }

    /// Number of free events parked at `location`
    pub fn available(&self, location: usize) -> usize {
        let pool = &self.locations[location % self.locations.len()];
        pool.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of events currently checked out
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of events ever allocated (pooled plus unbounded extras)
    pub fn allocated(&self) -> usize {
        self.arena.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("pool_size", &self.pool_size)
            .field("location_count", &self.locations.len())
            .field("limited", &self.limit_total_events_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    fn settings(pool_size: usize, location_count: usize, limit: bool) -> PoolSettings {
        PoolSettings {
            pool_size,
            location_count,
            limit_total_events_in_flight: limit,
        }
    }

    #[test]
    fn test_eager_allocation() {
        let pool = EventPool::new(&settings(4, 3, true)).unwrap();
        assert_eq!(pool.allocated(), 12);
        for loc in 0..3 {
            assert_eq!(pool.available(loc), 4);
        }
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_zero_locations_rejected() {
        assert!(EventPool::new(&settings(4, 0, true)).is_err());
    }

    #[test]
    fn test_bounded_pool_reports_unavailable() {
        let pool = EventPool::new(&settings(4, 2, true)).unwrap();
        let handles: Vec<_> = (0..8).map(|_| pool.get(0).expect("event")).collect();
        assert_eq!(pool.in_flight(), 8);
        assert!(pool.get(0).is_none());
        assert!(pool.get(1).is_none());

        let mut handles = handles.into_iter();
        pool.put(handles.next().unwrap(), 0);
        assert!(pool.get(0).is_some());
        assert_eq!(pool.allocated(), 8);
        for h in handles {
            pool.put(h, 0);
        }
    }

    #[test]
    fn test_put_never_overfills_a_location() {
        let pool = EventPool::new(&settings(4, 2, true)).unwrap();
        let handles: Vec<_> = (0..8).map(|_| pool.get(1).unwrap()).collect();
        for h in handles {
            pool.put(h, 0);
        }
        assert_eq!(pool.available(0), 4);
        assert_eq!(pool.available(1), 4);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_unbounded_fallback_allocates_and_reuses_spares() {
        let pool = EventPool::new(&settings(2, 1, false)).unwrap();
        let a = pool.get(0).unwrap();
        let b = pool.get(0).unwrap();
        let c = pool.get(0).expect("unbounded pool allocates a fresh event");
        assert_eq!(pool.allocated(), 3);

        pool.put(a, 0);
        pool.put(b, 0);
        pool.put(c, 0); // location full -> spare
        assert_eq!(pool.available(0), 2);

        let d = pool.get(0).unwrap();
        let e = pool.get(0).unwrap();
        let f = pool.get(0).unwrap();
        assert_eq!(pool.allocated(), 3, "spare should be reused before allocating");
        for h in [d, e, f] {
            pool.put(h, 0);
        }
    }

    #[test]
    fn test_allocation_does_not_wait_on_event_access() {
        let pool = Arc::new(EventPool::new(&settings(1, 1, false)).unwrap());
        let held = pool.get(0).unwrap();
        let (entered_tx, entered_rx) = bounded(0);
        let (release_tx, release_rx) = bounded::<()>(0);

        let worker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.with_event_mut(&held, |event| {
                    event.set_event_number(7);
                    entered_tx.send(()).unwrap();
                    release_rx.recv_timeout(Duration::from_secs(10)).unwrap();
                });
                held
            })
        };
        entered_rx.recv().unwrap();

        // Every pooled event is out, so this checkout must grow the arena
        // while the other thread is still inside its closure.
        let fresh = pool.get(0).expect("unbounded pool allocates");
        assert_eq!(pool.allocated(), 2);
        pool.with_event(&fresh, |event| assert_eq!(event.event_number(), 0));

        release_tx.send(()).unwrap();
        let held = worker.join().unwrap();
        pool.with_event(&held, |event| assert_eq!(event.event_number(), 7));
        pool.put(held, 0);
        pool.put(fresh, 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_events_are_reset_on_return() {
        let pool = EventPool::new(&settings(1, 1, true)).unwrap();
        let handle = pool.get(0).unwrap();
        pool.with_event_mut(&handle, |event| {
            event.set_event_number(99);
            event.insert("hits", vec![1u32, 2, 3]);
        });
        pool.put(handle, 0);

        let handle = pool.get(0).unwrap();
        pool.with_event(&handle, |event| {
            assert_eq!(event.event_number(), 0);
            assert_eq!(event.product_count(), 0);
        });
        pool.put(handle, 0);
    }

    #[test]
    fn test_concurrent_checkout_respects_limit() {
        let pool = Arc::new(EventPool::new(&settings(4, 2, true)).unwrap());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.get(0))
            })
            .collect();
        let handles: Vec<EventHandle> = threads
            .into_iter()
            .map(|t| t.join().unwrap().expect("each of the first 8 checkouts succeeds"))
            .collect();

        assert!(pool.get(0).is_none(), "9th checkout must be unavailable");
        let mut handles = handles.into_iter();
        pool.put(handles.next().unwrap(), 0);
        let ninth = pool.get(0).expect("available again after a return");
        pool.put(ninth, 0);
        for h in handles {
            pool.put(h, 1);
        }
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.available(0) <= 4 && pool.available(1) <= 4);
    }
}

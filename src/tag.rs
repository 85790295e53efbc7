use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use crate::strand::Strand;

/// Opaque handle correlating a submitted operation with the handler that
/// runs on its completion.
///
/// A `TagId` packs a 32-bit pool slot index and a 32-bit generation counter,
/// so a stale handle (kept past its slot's release) is detected instead of
/// silently resolving a reused slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(u64);

impl TagId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TagId({}/{})", self.index(), self.generation())
    }
}

pub(crate) type TagHandler = Box<dyn FnOnce(bool) + Send>;

pub(crate) struct TagRecord {
    pub handler: TagHandler,
    pub strand: Option<Arc<Strand>>,
    pub watchdog: bool,
}

enum SlotState {
    Free,
    Armed(TagRecord),
    Running,
}

struct Slot {
    generation: u32,
    state: SlotState,
}

struct PoolInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed-capacity allocator of completion tag records.
///
/// The pool is sized once at construction and never grows. Allocation beyond
/// capacity is a fatal error: it signals that the call concurrency ceiling
/// was misconfigured, and predictable latency is preferred over elasticity.
///
/// All operations are safe from any thread; the lock is held only for the
/// O(1) free-list push/pop.
pub struct TagPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    allocated: AtomicUsize,
    watchdogs: AtomicUsize,
}

impl TagPool {
    pub fn create(capacity: usize) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Free,
            })
            .collect();
        let free = (0..capacity as u32).rev().collect();
        Arc::new(Self {
            inner: Mutex::new(PoolInner { slots, free }),
            capacity,
            allocated: AtomicUsize::new(0),
            watchdogs: AtomicUsize::new(0),
        })
    }

    /// # Panics
    ///
    /// Panics when the pool is exhausted.
    pub(crate) fn allocate(&self, record: TagRecord) -> TagId {
        let watchdog = record.watchdog;
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner.free.pop() else {
                panic!("completion tag pool exhausted (capacity {})", self.capacity);
            };
            let slot = &mut inner.slots[index as usize];
            slot.state = SlotState::Armed(record);
            TagId::new(index, slot.generation)
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        if watchdog {
            self.watchdogs.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// Takes the record out of its slot for execution. The slot stays
    /// allocated until the returned [`ResolvedTag`] is dropped, after its
    /// handler has finished.
    ///
    /// # Panics
    ///
    /// Panics on a stale generation or a slot that is not armed. Both mean
    /// the same tag was resolved twice, which is a protocol violation
    /// upstream, not a recoverable error.
    pub(crate) fn resolve(self: &Arc<Self>, id: TagId, ok: bool) -> ResolvedTag {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = inner.slots.get_mut(id.index() as usize) else {
                panic!("completion tag {id:?} out of range");
            };
            assert_eq!(
                slot.generation,
                id.generation(),
                "completion tag {id:?} resolved after release"
            );
            match std::mem::replace(&mut slot.state, SlotState::Running) {
                SlotState::Armed(record) => record,
                other => {
                    slot.state = other;
                    panic!("completion tag {id:?} resolved twice");
                }
            }
        };
        ResolvedTag {
            pool: self.clone(),
            id,
            ok,
            watchdog: record.watchdog,
            strand: record.strand,
            handler: Some(record.handler),
        }
    }

    fn release(&self, id: TagId, watchdog: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[id.index() as usize];
            debug_assert!(matches!(slot.state, SlotState::Running));
            slot.state = SlotState::Free;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(id.index());
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        if watchdog {
            self.watchdogs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of outstanding tags. Used for shutdown diagnostics: leftovers
    /// indicate a transport-level tag leak.
    pub fn allocations(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Outstanding teardown watchdog tags, tracked separately because the
    /// transport may silently drop them during its own shutdown.
    pub fn watchdog_allocations(&self) -> usize {
        self.watchdogs.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for TagPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagPool")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocations())
            .finish()
    }
}

/// A completed tag taken out of the pool, ready to run.
///
/// The slot is released when this guard drops, so the handler has fully
/// finished before the slot can be reused.
pub(crate) struct ResolvedTag {
    pool: Arc<TagPool>,
    id: TagId,
    ok: bool,
    watchdog: bool,
    strand: Option<Arc<Strand>>,
    handler: Option<TagHandler>,
}

impl ResolvedTag {
    pub(crate) fn strand(&self) -> Option<&Arc<Strand>> {
        self.strand.as_ref()
    }

    /// Invokes the handler with the recorded success flag, then releases the
    /// slot back to the pool.
    pub(crate) fn run(mut self) {
        if let Some(handler) = self.handler.take() {
            handler(self.ok);
        }
    }
}

impl Drop for ResolvedTag {
    fn drop(&mut self) {
        self.pool.release(self.id, self.watchdog);
    }
}

impl std::fmt::Debug for ResolvedTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTag")
            .field("id", &self.id)
            .field("ok", &self.ok)
            .finish()
    }
}
